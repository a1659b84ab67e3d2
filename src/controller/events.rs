use std::sync::Arc;

use kube::ResourceExt;

use crate::kubernetes::informer::EventHandlers;
use crate::state::policy::PolicyState;
use crate::state::store::PolicyStore;
use crate::types::policy::StandSchedulePolicy;
use crate::workqueue::DelayingQueue;

/// Builds the informer callbacks maintaining the policy store. Every event
/// ends in a reconcile enqueue; resyncs re-run the ingest path so policies
/// dropped after exhausted retries are reintroduced.
pub fn policy_handlers(
    store: Arc<PolicyStore>,
    reconcile_queue: DelayingQueue<String>,
) -> EventHandlers<StandSchedulePolicy> {
    let on_add = {
        let store = store.clone();
        let queue = reconcile_queue.clone();
        Box::new(move |policy: Arc<StandSchedulePolicy>| {
            tracing::debug!(policy_name = %policy.name_any(), "discovered policy object");
            apply(&store, &queue, &policy);
        })
    };
    let on_update = {
        let store = store.clone();
        let queue = reconcile_queue.clone();
        Box::new(move |_old: Arc<StandSchedulePolicy>, new: Arc<StandSchedulePolicy>| {
            tracing::info!(policy_name = %new.name_any(), "sync policy object");
            apply(&store, &queue, &new);
        })
    };
    let on_delete = {
        let store = store.clone();
        let queue = reconcile_queue.clone();
        Box::new(move |policy: Arc<StandSchedulePolicy>| {
            tracing::info!(policy_name = %policy.name_any(), "deleted policy object");
            store.delete(&policy.name_any());
            queue.add(policy.name_any());
        })
    };
    let on_resync = {
        Box::new(move |policy: Arc<StandSchedulePolicy>| {
            apply(&store, &reconcile_queue, &policy);
        })
    };

    EventHandlers {
        on_add: Some(on_add),
        on_update: Some(on_update),
        on_delete: Some(on_delete),
        on_resync: Some(on_resync),
    }
}

/// Ingests a policy spec: rejects invalid schedules, keeps the stored state
/// (with its fire time and outcomes) when the schedule is unchanged, and
/// enqueues a reconcile either way.
pub(crate) fn apply(
    store: &PolicyStore,
    reconcile_queue: &DelayingQueue<String>,
    policy: &StandSchedulePolicy,
) {
    let name = policy.name_any();
    let state = match PolicyState::new(policy) {
        Ok(state) => state,
        Err(error) => {
            tracing::error!(policy_name = %name, %error, "policy object has invalid format");
            return;
        }
    };

    let unchanged = store
        .get(&name)
        .map(|existing| existing.lock().unwrap().schedule_equals(&state))
        .unwrap_or(false);
    if !unchanged {
        store.add_or_update(&name, state);
        tracing::info!(policy_name = %name, "added policy object");
    }
    reconcile_queue.add(name);
}
