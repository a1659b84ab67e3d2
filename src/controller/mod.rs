mod events;
pub mod reconcile;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use futures_util::FutureExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use stopper::Stopper;

use crate::azure::CloudProvider;
use crate::clock::Clock;
use crate::config::Config;
use crate::executor::{self, ExecutorContext, WorkItem};
use crate::kubernetes::informer::{EventHandlers, Informer};
use crate::kubernetes::{KubeCluster, PolicyApi, PolicyClient};
use crate::state::store::PolicyStore;
use crate::types::policy::StandSchedulePolicy;
use crate::worker::{ReconcileFn, Worker, WorkerConfig};
use crate::workqueue::DelayingQueue;

/// Wires informers, listers, the policy store and the two-stage worker
/// pipeline (reconciler + executor).
pub struct Controller {
    clock: Arc<dyn Clock>,
    store: Arc<PolicyStore>,
    policies: Informer<StandSchedulePolicy>,
    namespaces: Informer<Namespace>,
    reconcile_queue: DelayingQueue<String>,
    reconciler: Worker<String>,
    executor: Worker<WorkItem>,
}

impl Controller {
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        client: kube::Client,
        cloud: Arc<dyn CloudProvider>,
    ) -> Arc<Self> {
        let store = Arc::new(PolicyStore::new());

        let policies = Informer::new(
            Api::<StandSchedulePolicy>::all(client.clone()),
            config.policies_resync(),
        );
        let namespaces = Informer::new(
            Api::<Namespace>::all(client.clone()),
            config.objects_resync(),
        );

        let policy_api: Arc<dyn PolicyApi> =
            Arc::new(PolicyClient::new(client.clone(), policies.store()));
        let cluster = Arc::new(KubeCluster::new(client, namespaces.store()));

        let reconcile_queue = DelayingQueue::new("reconciler", clock.clone());
        let executor_queue = DelayingQueue::new("executor", clock.clone());

        let reconciler_ctx = Arc::new(reconcile::ReconcilerContext {
            store: store.clone(),
            policies: policy_api.clone(),
            executor_queue: executor_queue.clone(),
            clock: clock.clone(),
        });
        let executor_ctx = Arc::new(ExecutorContext {
            store: store.clone(),
            policies: policy_api,
            cluster,
            cloud,
            reconcile_queue: reconcile_queue.clone(),
            clock: clock.clone(),
        });

        let reconcile_fn: ReconcileFn<String> = Arc::new(move |name| {
            let ctx = reconciler_ctx.clone();
            async move { reconcile::reconcile(name, ctx).await.map_err(Into::into) }.boxed()
        });
        let execute_fn: ReconcileFn<WorkItem> = Arc::new(move |item| {
            let ctx = executor_ctx.clone();
            async move { executor::execute(item, ctx).await.map_err(Into::into) }.boxed()
        });

        let reconciler = Worker::new(
            WorkerConfig {
                name: "reconciler",
                retries: config.worker_queue_retries(),
                threadiness: config.reconciler_threadiness(),
            },
            reconcile_queue.clone(),
            reconcile_fn,
        );
        let executor = Worker::new(
            WorkerConfig {
                name: "executor",
                retries: config.worker_queue_retries(),
                threadiness: config.executor_threadiness(),
            },
            executor_queue,
            execute_fn,
        );

        Arc::new(Self {
            clock,
            store,
            policies,
            namespaces,
            reconcile_queue,
            reconciler,
            executor,
        })
    }

    /// Starts informers, waits for every cache to sync and starts both
    /// workers; resolves once the interrupt fires. An interrupted cache sync
    /// is the single fatal startup error.
    pub async fn run(self: Arc<Self>, interrupt: Stopper) -> anyhow::Result<()> {
        let handlers = events::policy_handlers(self.store.clone(), self.reconcile_queue.clone());
        self.policies.run(handlers, self.clock.clone(), &interrupt);
        self.namespaces
            .run(EventHandlers::default(), self.clock.clone(), &interrupt);

        let synced = self.policies.wait_for_cache_sync(&interrupt).await
            && self.namespaces.wait_for_cache_sync(&interrupt).await;
        if !synced {
            anyhow::bail!("failed to sync informer caches before interrupt");
        }
        tracing::info!("informer caches synced");

        self.reconciler.start(&interrupt);
        self.executor.start(&interrupt);
        tracing::info!("controller started");

        interrupt.stop_future(std::future::pending::<()>()).await;
        tracing::info!("controller stopped");
        Ok(())
    }
}
