use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::state::policy::PolicyState;

/// Concurrency-safe mapping from policy name to its schedule state pair. The
/// store has no scheduling awareness; entries carry their own lock so workers
/// running with higher threadiness stay safe.
#[derive(Default)]
pub struct PolicyStore {
    data: Mutex<HashMap<String, Arc<Mutex<PolicyState>>>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update(&self, name: &str, state: PolicyState) {
        let mut data = self.data.lock().unwrap();
        data.insert(name.to_string(), Arc::new(Mutex::new(state)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<PolicyState>>> {
        let data = self.data.lock().unwrap();
        data.get(name).cloned()
    }

    pub fn delete(&self, name: &str) {
        let mut data = self.data.lock().unwrap();
        data.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::PolicyStore;
    use crate::state::policy::PolicyState;

    #[test]
    fn add_get_delete() {
        let store = PolicyStore::new();
        assert!(store.get("a").is_none());

        store.add_or_update("a", PolicyState::default());
        assert!(store.get("a").is_some());

        store.delete("a");
        assert!(store.get("a").is_none());
    }
}
