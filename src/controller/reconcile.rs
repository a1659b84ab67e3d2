use std::sync::Arc;

use thiserror::Error;

use crate::clock::Clock;
use crate::executor::WorkItem;
use crate::kubernetes::PolicyApi;
use crate::state::store::PolicyStore;
use crate::types::policy::ScheduleSide;
use crate::workqueue::DelayingQueue;

pub struct ReconcilerContext {
    pub store: Arc<PolicyStore>,
    pub policies: Arc<dyn PolicyApi>,
    pub executor_queue: DelayingQueue<WorkItem>,
    pub clock: Arc<dyn Clock>,
}

/// Errors raised within the reconciler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to update policy status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
}

/// Re-arms due schedule sides, enqueues executor work items with their fire
/// delay and refreshes the derived status subresource. A missing policy or
/// schedule state ends the reconcile cleanly.
pub async fn reconcile(name: String, ctx: Arc<ReconcilerContext>) -> Result<(), Error> {
    if ctx.policies.get_cached(&name).is_none() {
        tracing::info!(policy_name = %name, "deleted policy removed from execution");
        return Ok(());
    }
    let Some(entry) = ctx.store.get(&name) else {
        tracing::info!(policy_name = %name, "policy without schedule state skipped");
        return Ok(());
    };

    let now = ctx.clock.now();
    let mut items = Vec::new();
    let status = {
        let mut state = entry.lock().unwrap();
        for side in ScheduleSide::BOTH {
            let schedule = state.schedule_mut(side);
            if !schedule.schedule_required(now) {
                continue;
            }
            schedule.set_fired_after(now);
            if let Some(fire_at) = schedule.fire_time() {
                tracing::info!(policy_name = %name, %side, %fire_at, "schedule policy side at time");
                items.push(WorkItem {
                    policy_name: name.clone(),
                    side,
                    fire_at,
                });
            }
        }
        state.status()
    };

    for item in items {
        let delay = (item.fire_at - now).to_std().unwrap_or_default();
        ctx.executor_queue.add_after(item, delay);
    }

    ctx.policies
        .update_status(&name, &status)
        .await
        .map_err(Error::StatusUpdateFailed)?;
    Ok(())
}
