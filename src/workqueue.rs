use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock::{chrono_duration, Clock};

/// Bounds required from queue payloads.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> Key for T {}

struct Waiting<T> {
    ready_at: DateTime<Utc>,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed, so the earliest deadline surfaces first
        other.ready_at.cmp(&self.ready_at)
    }
}

struct Inner<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: BinaryHeap<Waiting<T>>,
    shutting_down: bool,
}

/// Rate-limit-friendly delaying queue modeled on client-go's workqueue: an
/// item added while pending or being processed is coalesced, and an item
/// re-added during processing lands back on the queue once `done` releases
/// it. Delayed adds go through an injected clock so tests can advance time.
pub struct DelayingQueue<T: Key> {
    name: &'static str,
    inner: Arc<Mutex<Inner<T>>>,
    ready: Arc<Notify>,
    delay: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl<T: Key> Clone for DelayingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            ready: self.ready.clone(),
            delay: self.delay.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<T: Key> DelayingQueue<T> {
    pub fn new(name: &'static str, clock: Arc<dyn Clock>) -> Self {
        let queue = Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                shutting_down: false,
            })),
            ready: Arc::new(Notify::new()),
            delay: Arc::new(Notify::new()),
            clock,
        };
        let delay_loop = queue.clone();
        tokio::spawn(async move { delay_loop.run_delay_loop().await });
        queue
    }

    /// Enqueues immediately; a no-op while the item is already pending.
    pub fn add(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down || inner.dirty.contains(&item) {
                return;
            }
            inner.dirty.insert(item.clone());
            if inner.processing.contains(&item) {
                return;
            }
            inner.queue.push_back(item);
        }
        self.ready.notify_one();
    }

    /// Enqueues once `delay` has elapsed on the queue's clock.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let ready_at = self.clock.now() + chrono_duration(delay);
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return;
            }
            inner.waiting.push(Waiting { ready_at, item });
        }
        self.delay.notify_one();
    }

    /// Blocking dequeue. Returns `None` once the queue shuts down. The item
    /// is marked as processing until released with [`DelayingQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutting_down {
                    drop(inner);
                    // wake the next parked consumer so shutdown cascades
                    self.ready.notify_one();
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
            }
            self.ready.notified().await;
        }
    }

    /// Releases the processing mark; re-queues the item when it was re-added
    /// meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut inner = self.inner.lock().unwrap();
            inner.processing.remove(item);
            if inner.dirty.contains(item) {
                inner.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.ready.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes pending and future `get` calls return `None`.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.shutting_down = true;
        }
        tracing::debug!(queue = self.name, "queue shutting down");
        self.ready.notify_one();
        self.delay.notify_one();
    }

    async fn run_delay_loop(self) {
        loop {
            let next = {
                let inner = self.inner.lock().unwrap();
                if inner.shutting_down {
                    break;
                }
                inner.waiting.peek().map(|waiting| waiting.ready_at)
            };

            let Some(ready_at) = next else {
                self.delay.notified().await;
                continue;
            };

            let now = self.clock.now();
            if ready_at > now {
                let wait = (ready_at - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = self.clock.sleep(wait) => {}
                    _ = self.delay.notified() => {}
                }
                continue;
            }

            let due = {
                let mut inner = self.inner.lock().unwrap();
                let mut due = Vec::new();
                while inner.waiting.peek().map(|w| w.ready_at <= now).unwrap_or(false) {
                    if let Some(waiting) = inner.waiting.pop() {
                        due.push(waiting.item);
                    }
                }
                due
            };
            for item in due {
                self.add(item);
            }
        }
    }
}

/// Per-key exponential backoff with observable requeue counts.
pub struct RateLimiter<T: Key> {
    failures: Mutex<HashMap<T, u32>>,
    base: Duration,
    max: Duration,
}

impl<T: Key> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl<T: Key> RateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base,
            max,
        }
    }

    /// Records a failure and returns the backoff before the next retry.
    pub fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count += 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().unwrap().get(item).copied().unwrap_or(0)
    }

    pub fn forget(&self, item: &T) {
        self.failures.lock().unwrap().remove(item);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::{DelayingQueue, RateLimiter};
    use crate::clock::FakeClock;

    fn fake_clock() -> FakeClock {
        FakeClock::new(Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn add_deduplicates_pending_items() {
        let queue = DelayingQueue::new("test", Arc::new(fake_clock()));
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn add_during_processing_requeues_on_done() {
        let queue = DelayingQueue::new("test", Arc::new(fake_clock()));
        queue.add("a".to_string());

        let item = queue.get().await.unwrap();
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn add_after_fires_once_the_clock_advances() {
        let clock = fake_clock();
        let queue = DelayingQueue::new("test", Arc::new(clock.clone()));
        queue.add_after("a".to_string(), Duration::from_secs(60));

        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        clock.advance(Duration::from_secs(61));
        let item = tokio::time::timeout(Duration::from_secs(5), queue.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, "a");
    }

    #[tokio::test]
    async fn shutdown_unblocks_getters() {
        let queue: DelayingQueue<String> = DelayingQueue::new("test", Arc::new(fake_clock()));
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        let got = tokio::time::timeout(Duration::from_secs(5), getter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn rate_limiter_backs_off_exponentially() {
        let limiter = RateLimiter::new(Duration::from_secs(1), Duration::from_secs(8));
        let key = "k".to_string();

        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_secs(1));
        assert_eq!(limiter.when(&key), Duration::from_secs(2));
        assert_eq!(limiter.when(&key), Duration::from_secs(4));
        assert_eq!(limiter.when(&key), Duration::from_secs(8));
        assert_eq!(limiter.when(&key), Duration::from_secs(8));
        assert_eq!(limiter.num_requeues(&key), 5);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
