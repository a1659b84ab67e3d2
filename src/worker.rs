use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use stopper::Stopper;

use crate::workqueue::{DelayingQueue, Key, RateLimiter};

pub type ReconcileFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub name: &'static str,
    pub retries: u32,
    pub threadiness: usize,
}

/// Fixed-size pool draining a work queue. Failed items are requeued with
/// rate-limited backoff up to the retry cap; panics inside the handler are
/// recovered and the worker keeps going.
pub struct Worker<T: Key> {
    config: WorkerConfig,
    queue: DelayingQueue<T>,
    limiter: Arc<RateLimiter<T>>,
    reconcile: ReconcileFn<T>,
}

impl<T: Key> Worker<T> {
    pub fn new(config: WorkerConfig, queue: DelayingQueue<T>, reconcile: ReconcileFn<T>) -> Self {
        Self {
            config,
            queue,
            limiter: Arc::new(RateLimiter::default()),
            reconcile,
        }
    }

    pub fn start(&self, interrupt: &Stopper) {
        for _ in 0..self.config.threadiness.max(1) {
            let config = self.config.clone();
            let queue = self.queue.clone();
            let limiter = self.limiter.clone();
            let reconcile = self.reconcile.clone();
            tokio::spawn(async move {
                while process_next(&config, &queue, &limiter, &reconcile).await {}
                tracing::debug!(worker = config.name, "worker loop stopped");
            });
        }

        let queue = self.queue.clone();
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            interrupt.stop_future(std::future::pending::<()>()).await;
            queue.shutdown();
        });
    }
}

async fn process_next<T: Key>(
    config: &WorkerConfig,
    queue: &DelayingQueue<T>,
    limiter: &RateLimiter<T>,
    reconcile: &ReconcileFn<T>,
) -> bool {
    let Some(item) = queue.get().await else {
        return false;
    };

    match AssertUnwindSafe(reconcile(item.clone())).catch_unwind().await {
        Ok(Ok(())) => {
            limiter.forget(&item);
        }
        Ok(Err(error)) => {
            tracing::info!(worker = config.name, worker_key = ?item, %error, "failed to process key");
            if limiter.num_requeues(&item) < config.retries {
                tracing::info!(worker = config.name, worker_key = ?item, "requeue key");
                queue.add_after(item.clone(), limiter.when(&item));
            } else {
                tracing::info!(worker = config.name, worker_key = ?item, "forget failed key");
                limiter.forget(&item);
            }
        }
        Err(_) => {
            tracing::error!(worker = config.name, worker_key = ?item, "recovered from panic while processing key");
            limiter.forget(&item);
        }
    }

    queue.done(&item);
    true
}
