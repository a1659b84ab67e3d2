use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use stopper::Stopper;

use super::events;
use super::reconcile::{self, ReconcilerContext};
use crate::clock::{Clock, FakeClock};
use crate::executor::{self, ExecutorContext, WorkItem};
use crate::state::store::PolicyStore;
use crate::testing::{
    deployment, policy, policy_with_schedules, running_pod, test_time, zero_quota, FakeCloud,
    FakeCluster, FakePolicies,
};
use crate::types::policy::{
    AzureResourceFilter, AzureResourceKind, CronSchedule, PolicyConditionType, ScheduleSide,
    SchedulesSpec, StandSchedulePolicy, RESTORE_REPLICAS_ANNOTATION,
};
use crate::worker::{ReconcileFn, Worker, WorkerConfig};
use crate::workqueue::DelayingQueue;

/// End-to-end harness: fake cluster, cloud, policy API and clock driving the
/// real queues, workers, reconciler and executor.
struct Harness {
    clock: FakeClock,
    store: Arc<PolicyStore>,
    cluster: Arc<FakeCluster>,
    cloud: Arc<FakeCloud>,
    policies: Arc<FakePolicies>,
    reconcile_queue: DelayingQueue<String>,
    executor_ctx: Arc<ExecutorContext>,
    interrupt: Stopper,
}

impl Harness {
    fn new(cluster: FakeCluster, cloud: FakeCloud) -> Self {
        let clock = FakeClock::new(test_time());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(PolicyStore::new());
        let cluster = Arc::new(cluster);
        let cloud = Arc::new(cloud);
        let policies = Arc::new(FakePolicies::default());

        let reconcile_queue = DelayingQueue::new("reconciler", shared_clock.clone());
        let executor_queue = DelayingQueue::new("executor", shared_clock.clone());

        let reconciler_ctx = Arc::new(ReconcilerContext {
            store: store.clone(),
            policies: policies.clone(),
            executor_queue: executor_queue.clone(),
            clock: shared_clock.clone(),
        });
        let executor_ctx = Arc::new(ExecutorContext {
            store: store.clone(),
            policies: policies.clone(),
            cluster: cluster.clone(),
            cloud: cloud.clone(),
            reconcile_queue: reconcile_queue.clone(),
            clock: shared_clock,
        });

        let reconcile_fn: ReconcileFn<String> = {
            let ctx = reconciler_ctx.clone();
            Arc::new(move |name| {
                let ctx = ctx.clone();
                async move { reconcile::reconcile(name, ctx).await.map_err(Into::into) }.boxed()
            })
        };
        let execute_fn: ReconcileFn<WorkItem> = {
            let ctx = executor_ctx.clone();
            Arc::new(move |item| {
                let ctx = ctx.clone();
                async move { executor::execute(item, ctx).await.map_err(Into::into) }.boxed()
            })
        };

        let interrupt = Stopper::new();
        Worker::new(
            WorkerConfig {
                name: "reconciler",
                retries: 2,
                threadiness: 1,
            },
            reconcile_queue.clone(),
            reconcile_fn,
        )
        .start(&interrupt);
        Worker::new(
            WorkerConfig {
                name: "executor",
                retries: 2,
                threadiness: 1,
            },
            executor_queue,
            execute_fn,
        )
        .start(&interrupt);

        Self {
            clock,
            store,
            cluster,
            cloud,
            policies,
            reconcile_queue,
            executor_ctx,
            interrupt,
        }
    }

    fn apply(&self, policy: &StandSchedulePolicy) {
        self.policies.put(policy);
        events::apply(&self.store, &self.reconcile_queue, policy);
    }

    async fn eventually(&self, what: &str, check: impl Fn() -> bool) {
        let wait = async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("timed out waiting for {what}");
        }
    }

    fn has_condition(&self, name: &str, kind: PolicyConditionType, side: ScheduleSide) -> bool {
        self.policies
            .status(name)
            .map(|status| {
                status
                    .conditions
                    .iter()
                    .any(|condition| condition.kind == kind && condition.status == side)
            })
            .unwrap_or(false)
    }

    fn executed(&self, name: &str, side: ScheduleSide) -> bool {
        self.store
            .get(name)
            .map(|entry| entry.lock().unwrap().schedule(side).executed_time().is_some())
            .unwrap_or(false)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.interrupt.stop();
    }
}

fn cloud_filters() -> Vec<AzureResourceFilter> {
    vec![
        AzureResourceFilter {
            kind: AzureResourceKind::VirtualMachine,
            resource_group_name: "test-2-rg".to_string(),
            resource_name_filter: "vm-.*".to_string(),
            priority: 0,
        },
        AzureResourceFilter {
            kind: AzureResourceKind::ManagedMySql,
            resource_group_name: "test-1-rg".to_string(),
            resource_name_filter: "db-.*".to_string(),
            priority: 1,
        },
    ]
}

fn cloud_with_resources() -> FakeCloud {
    FakeCloud::with_resources(&[
        "/subscriptions/11111111-2222-3333-4444-555555555555/resourceGroups/test-2-rg/providers/Microsoft.Compute/virtualMachines/vm-1",
        "/subscriptions/11111111-2222-3333-4444-555555555555/resourceGroups/test-1-rg/providers/Microsoft.DBforMySQL/servers/db-1",
    ])
}

#[tokio::test]
async fn pure_shutdown_scales_workloads_and_blocks_pods() {
    let cluster = FakeCluster::with_namespaces(&["ns1"]);
    {
        let mut state = cluster.state.lock().unwrap();
        state.deployments.push(deployment("ns1", "web", 3, None));
        state.pods.push(running_pod("ns1", "web-pod"));
    }
    let harness = Harness::new(cluster, FakeCloud::default());

    let stand = policy_with_schedules("stand", "ns1", "@yearly", "* * * * *");
    harness.apply(&stand);
    harness
        .eventually("shutdown scheduled", || {
            harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Shutdown)
        })
        .await;

    harness.clock.advance(Duration::from_secs(120));
    harness
        .eventually("shutdown completed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;

    assert_eq!(harness.cluster.quota_names("ns1"), vec!["zero-quota"]);
    let web = harness.cluster.deployment("ns1", "web").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(0));
    assert_eq!(
        web.metadata
            .annotations
            .unwrap()
            .get(RESTORE_REPLICAS_ANNOTATION),
        Some(&"3".to_string())
    );
    assert_eq!(harness.cluster.pod_count("ns1"), 0);
}

#[tokio::test]
async fn pure_startup_restores_workloads_and_quota() {
    let cluster = FakeCluster::with_namespaces(&["ns2"]);
    {
        let mut state = cluster.state.lock().unwrap();
        state.deployments.push(deployment("ns2", "web", 0, Some("3")));
        state.quotas.push(zero_quota("ns2"));
    }
    let harness = Harness::new(cluster, FakeCloud::default());

    let stand = policy_with_schedules("stand", "ns2", "* * * * *", "@yearly");
    harness.apply(&stand);
    harness
        .eventually("startup scheduled", || {
            harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Startup)
        })
        .await;

    harness.clock.advance(Duration::from_secs(120));
    harness
        .eventually("startup completed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Startup)
        })
        .await;

    assert!(harness.cluster.quota_names("ns2").is_empty());
    let web = harness.cluster.deployment("ns2", "web").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(3));
    assert!(!web
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(RESTORE_REPLICAS_ANNOTATION));
}

#[tokio::test]
async fn override_fires_once_and_never_rearms() {
    let harness = Harness::new(FakeCluster::with_namespaces(&["other"]), FakeCloud::default());

    let stand = policy(
        "stand",
        "none-matching",
        SchedulesSpec {
            startup: CronSchedule::default(),
            shutdown: CronSchedule {
                cron: String::new(),
                override_time: (test_time() + chrono::Duration::seconds(1)).to_rfc3339(),
            },
        },
        Vec::new(),
    );
    harness.apply(&stand);
    harness
        .eventually("shutdown scheduled", || {
            harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Shutdown)
        })
        .await;
    harness
        .eventually("startup disabled", || {
            harness
                .policies
                .status("stand")
                .and_then(|status| status.startup)
                .as_deref()
                == Some("Disabled")
        })
        .await;

    harness.clock.advance(Duration::from_secs(120));
    harness
        .eventually("shutdown completed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;

    // resync after five more minutes must not re-arm the consumed override
    harness.clock.advance(Duration::from_secs(300));
    harness.apply(&stand);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown));
    assert!(harness.executed("stand", ScheduleSide::Shutdown));
    assert!(!harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Startup));
}

#[tokio::test]
async fn alternating_pair_rearms_after_midpoint() {
    let harness = Harness::new(FakeCluster::with_namespaces(&["other"]), FakeCloud::default());

    // clock starts aligned on a 10-minute boundary
    let stand = policy_with_schedules("stand", "none-matching", "0/5 * * * *", "0/3 * * * *");
    harness.apply(&stand);
    harness
        .eventually("both sides scheduled", || {
            harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Shutdown)
                && harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Startup)
        })
        .await;

    harness.clock.advance(Duration::from_secs(180));
    harness
        .eventually("shutdown completed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;

    // startup completion reconcile crosses the shutdown midpoint and re-arms it
    harness.clock.advance(Duration::from_secs(120));
    harness
        .eventually("startup completed and shutdown re-armed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Startup)
                && !harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;

    harness.clock.advance(Duration::from_secs(60));
    harness
        .eventually("shutdown completed again", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;

    // resync past the startup midpoint re-arms startup
    harness.clock.advance(Duration::from_secs(180));
    harness.apply(&stand);
    harness
        .eventually("startup re-armed", || {
            !harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Startup)
        })
        .await;
}

#[tokio::test]
async fn cloud_priority_buckets_are_ordered() {
    let harness = Harness::new(FakeCluster::with_namespaces(&["other"]), cloud_with_resources());

    let stand = policy(
        "stand",
        "none-matching",
        SchedulesSpec {
            startup: CronSchedule {
                cron: "@yearly".to_string(),
                override_time: String::new(),
            },
            shutdown: CronSchedule {
                cron: "* * * * *".to_string(),
                override_time: String::new(),
            },
        },
        cloud_filters(),
    );
    harness.apply(&stand);
    harness
        .eventually("shutdown scheduled", || {
            harness.has_condition("stand", PolicyConditionType::Scheduled, ScheduleSide::Shutdown)
        })
        .await;

    harness.clock.advance(Duration::from_secs(120));
    harness
        .eventually("shutdown completed", || {
            harness.has_condition("stand", PolicyConditionType::Completed, ScheduleSide::Shutdown)
        })
        .await;
    assert_eq!(harness.cloud.operations(), vec!["stop vm-1", "stop db-1"]);

    // startup reverses the priority order
    let item = WorkItem {
        policy_name: "stand".to_string(),
        side: ScheduleSide::Startup,
        fire_at: Clock::now(&harness.clock),
    };
    executor::execute(item, harness.executor_ctx.clone()).await.unwrap();
    assert_eq!(
        harness.cloud.operations(),
        vec!["stop vm-1", "stop db-1", "start db-1", "start vm-1"]
    );
}

#[tokio::test]
async fn missed_window_is_skipped_without_side_effects() {
    let harness = Harness::new(FakeCluster::with_namespaces(&["ns1"]), cloud_with_resources());

    let stand = policy("stand", "ns1", SchedulesSpec::default(), cloud_filters());
    harness.apply(&stand);
    harness
        .eventually("status written", || harness.policies.status("stand").is_some())
        .await;

    let item = WorkItem {
        policy_name: "stand".to_string(),
        side: ScheduleSide::Shutdown,
        fire_at: test_time() - chrono::Duration::minutes(31),
    };
    executor::execute(item, harness.executor_ctx.clone()).await.unwrap();

    assert!(harness.cluster.calls().is_empty());
    assert!(harness.cloud.calls().is_empty());
    assert!(!harness.executed("stand", ScheduleSide::Shutdown));
}

#[tokio::test]
async fn shutdown_and_startup_are_idempotent() {
    let cluster = FakeCluster::with_namespaces(&["ns1"]);
    {
        let mut state = cluster.state.lock().unwrap();
        state.deployments.push(deployment("ns1", "web", 3, None));
        state.pods.push(running_pod("ns1", "web-pod"));
    }
    let harness = Harness::new(cluster, FakeCloud::default());

    let stand = policy_with_schedules("stand", "ns1", "@yearly", "@yearly");
    harness.apply(&stand);
    harness
        .eventually("status written", || harness.policies.status("stand").is_some())
        .await;

    let now = Clock::now(&harness.clock);
    let shutdown = WorkItem {
        policy_name: "stand".to_string(),
        side: ScheduleSide::Shutdown,
        fire_at: now,
    };
    executor::execute(shutdown.clone(), harness.executor_ctx.clone()).await.unwrap();
    executor::execute(shutdown, harness.executor_ctx.clone()).await.unwrap();

    let web = harness.cluster.deployment("ns1", "web").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(0));
    assert_eq!(
        web.metadata
            .annotations
            .unwrap()
            .get(RESTORE_REPLICAS_ANNOTATION),
        Some(&"3".to_string())
    );
    assert_eq!(harness.cluster.quota_names("ns1"), vec!["zero-quota"]);

    let startup = WorkItem {
        policy_name: "stand".to_string(),
        side: ScheduleSide::Startup,
        fire_at: now,
    };
    executor::execute(startup.clone(), harness.executor_ctx.clone()).await.unwrap();
    executor::execute(startup, harness.executor_ctx.clone()).await.unwrap();

    let web = harness.cluster.deployment("ns1", "web").unwrap();
    assert_eq!(web.spec.unwrap().replicas, Some(3));
    assert!(!web
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(RESTORE_REPLICAS_ANNOTATION));
    assert!(harness.cluster.quota_names("ns1").is_empty());
}

#[tokio::test]
async fn execution_skips_deleted_policy() {
    let cluster = FakeCluster::with_namespaces(&["ns1"]);
    cluster
        .state
        .lock()
        .unwrap()
        .deployments
        .push(deployment("ns1", "web", 3, None));
    let harness = Harness::new(cluster, FakeCloud::default());

    let stand = policy_with_schedules("stand", "ns1", "@yearly", "@yearly");
    harness.apply(&stand);
    harness.policies.remove("stand");

    let item = WorkItem {
        policy_name: "stand".to_string(),
        side: ScheduleSide::Shutdown,
        fire_at: Clock::now(&harness.clock),
    };
    executor::execute(item, harness.executor_ctx.clone()).await.unwrap();

    assert!(harness.cluster.calls().is_empty());
    assert!(!harness.executed("stand", ScheduleSide::Shutdown));
}

#[tokio::test]
async fn invalid_policy_is_not_armed() {
    let harness = Harness::new(FakeCluster::with_namespaces(&["ns1"]), FakeCloud::default());

    let stand = policy_with_schedules("stand", "ns1", "bad cron", "* * * * *");
    harness.policies.put(&stand);
    events::apply(&harness.store, &harness.reconcile_queue, &stand);

    assert!(harness.store.get("stand").is_none());
}
