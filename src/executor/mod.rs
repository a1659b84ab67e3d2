mod algs;
mod cloud;
mod cluster;

pub use algs::sort_namespaces;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::azure::{self, CloudProvider};
use crate::clock::{chrono_duration, Clock};
use crate::kubernetes::{ClusterOps, PolicyApi};
use crate::state::store::PolicyStore;
use crate::types::policy::{ScheduleSide, StandSchedulePolicy};
use crate::workqueue::DelayingQueue;

/// Executor queue payload; equal values coalesce in the queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub policy_name: String,
    pub side: ScheduleSide,
    pub fire_at: DateTime<Utc>,
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} at {}", self.policy_name, self.side, self.fire_at)
    }
}

/// Grace period after the fire time during which delivery still executes.
pub const FIRE_DEADLINE: Duration = Duration::from_secs(30 * 60);
/// Budget for a single shutdown or startup transition.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub const RESOURCE_QUOTA_NAME: &str = "zero-quota";

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("cloud error: {0}")]
    Cloud(#[from] azure::Error),
    #[error("invalid filter {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid replicas annotation {value:?} on {name}")]
    InvalidReplicasAnnotation { name: String, value: String },
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("multiple errors: [{}]", format_errors(.0))]
    Multiple(Vec<Error>),
}

fn format_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Combines accumulated errors; an empty list is success.
    pub fn combine(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

pub struct ExecutorContext {
    pub store: Arc<PolicyStore>,
    pub policies: Arc<dyn PolicyApi>,
    pub cluster: Arc<dyn ClusterOps>,
    pub cloud: Arc<dyn CloudProvider>,
    pub reconcile_queue: DelayingQueue<String>,
    pub clock: Arc<dyn Clock>,
}

/// Runs the orchestrated transition for a fired work item. Early or stale
/// deliveries and missing policies are skipped without side effects; the
/// outcome of a real run is recorded on the schedule state and surfaced by
/// enqueueing a reconcile.
pub async fn execute(item: WorkItem, ctx: Arc<ExecutorContext>) -> Result<(), Error> {
    let now = ctx.clock.now();
    if now < item.fire_at {
        tracing::warn!(item = %item, %now, "skip execution before scheduled time");
        return Ok(());
    }
    if now > item.fire_at + chrono_duration(FIRE_DEADLINE) {
        tracing::warn!(item = %item, %now, "skip execution after deadline");
        return Ok(());
    }

    let (Some(entry), Some(policy)) = (
        ctx.store.get(&item.policy_name),
        ctx.policies.get_cached(&item.policy_name),
    ) else {
        tracing::warn!(item = %item, "skip execution of missing policy");
        return Ok(());
    };

    tracing::info!(policy_name = %item.policy_name, side = %item.side, "execute schedule of policy");
    let result = match tokio::time::timeout(EXECUTION_TIMEOUT, run_side(&ctx, item.side, &policy)).await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(EXECUTION_TIMEOUT)),
    };

    {
        let mut state = entry.lock().unwrap();
        state.schedule_mut(item.side).record(now, &result);
    }
    ctx.reconcile_queue.add(item.policy_name.clone());

    if let Err(error) = &result {
        tracing::error!(policy_name = %item.policy_name, side = %item.side, %error, "failed to execute schedule of policy");
    }
    result
}

async fn run_side(
    ctx: &ExecutorContext,
    side: ScheduleSide,
    policy: &StandSchedulePolicy,
) -> Result<(), Error> {
    match side {
        ScheduleSide::Shutdown => {
            let (cluster, cloud) = tokio::join!(
                cluster::shutdown(ctx, policy),
                cloud::shutdown(ctx, &policy.spec.resources.azure),
            );
            Error::combine(cluster.err().into_iter().chain(cloud.err()).collect())
        }
        ScheduleSide::Startup => {
            let (cloud, cluster) = tokio::join!(
                cloud::startup(ctx, &policy.spec.resources.azure),
                cluster::startup(ctx, policy),
            );
            Error::combine(cloud.err().into_iter().chain(cluster.err()).collect())
        }
    }
}
