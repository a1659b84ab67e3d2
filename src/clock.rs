use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Time source injected into every component that reads "now" or sleeps.
/// Tests substitute [`FakeClock`] to advance time deterministically.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Converts a std duration, saturating instead of failing on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000))
}

struct Sleeper {
    wake_at: DateTime<Utc>,
    tx: oneshot::Sender<()>,
}

struct FakeClockInner {
    now: DateTime<Utc>,
    sleepers: Vec<Sleeper>,
}

/// Manually driven clock. `sleep` parks the caller until [`FakeClock::advance`]
/// moves the current time past its deadline.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockInner>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockInner {
                now,
                sleepers: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let woken = {
            let mut inner = self.inner.lock().unwrap();
            inner.now = inner.now + chrono_duration(duration);
            let now = inner.now;
            let (due, parked) = inner
                .sleepers
                .drain(..)
                .partition::<Vec<_>, _>(|sleeper| sleeper.wake_at <= now);
            inner.sleepers = parked;
            due
        };
        for sleeper in woken {
            let _ = sleeper.tx.send(());
        }
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            let wake_at = inner.now + chrono_duration(duration);
            inner.sleepers.push(Sleeper { wake_at, tx });
        }
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::{Clock, FakeClock};

    #[tokio::test]
    async fn fake_clock_advances_and_wakes_sleepers() {
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap());
        let start = clock.now();

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(60));
        sleeper.await.unwrap();

        assert_eq!(clock.now() - start, chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let clock = FakeClock::new(Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap());
        clock.sleep(Duration::ZERO).await;
    }
}
