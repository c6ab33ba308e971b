//! Per-layer value store
//!
//! Maps node names to their current [`ValueRecord`]. Records are held behind
//! `Arc` and swapped whole, so a reader (for example the publication
//! endpoint serving a remote layer) always sees a complete record even while
//! a run is writing its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{NodeId, ValueRecord};

/// Value records of one layer plus its logical clock
#[derive(Debug, Default)]
pub struct ValueStore {
    records: RwLock<HashMap<NodeId, Arc<ValueRecord>>>,
    clock: AtomicU64,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a pending record for every named node
    pub fn with_nodes<'a>(names: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let store = Self::new();
        {
            let mut records = store.records.write();
            for name in names {
                records.insert(name.clone(), Arc::new(ValueRecord::pending()));
            }
        }
        store
    }

    /// Snapshot of a node's current record
    pub fn get(&self, name: &str) -> Option<Arc<ValueRecord>> {
        self.records.read().get(name).cloned()
    }

    /// Current version of a node, if known
    pub fn version(&self, name: &str) -> Option<u64> {
        self.records.read().get(name).map(|r| r.version)
    }

    /// Replace a node's record in a single step
    pub fn replace(&self, name: &str, record: ValueRecord) {
        self.records.write().insert(name.to_string(), Arc::new(record));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.read().contains_key(name)
    }

    /// Snapshot of every record
    pub fn snapshot(&self) -> HashMap<NodeId, Arc<ValueRecord>> {
        self.records.read().clone()
    }

    /// Advance the logical clock and return the new tick
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current logical clock value
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::types::NodeStatus;
    use serde_json::json;

    #[test]
    fn test_nodes_start_pending() {
        let names = vec!["a".to_string(), "b".to_string()];
        let store = ValueStore::with_nodes(&names);
        let a = store.get("a").unwrap();
        assert_eq!(a.status, NodeStatus::Pending);
        assert_eq!(a.version, 0);
        assert!(store.get("c").is_none());
    }

    #[test]
    fn test_replace_keeps_old_snapshot_intact() {
        let names = vec!["a".to_string()];
        let store = ValueStore::with_nodes(&names);
        let before = store.get("a").unwrap();

        let next = before.succeeded(json!(1), Fingerprint::of(&json!(1)), store.tick());
        store.replace("a", next);

        assert_eq!(before.status, NodeStatus::Pending);
        let after = store.get("a").unwrap();
        assert_eq!(after.value, json!(1));
        assert_eq!(after.version, 1);
        assert_eq!(after.computed_at, 1);
        assert_eq!(store.version("a"), Some(1));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let store = ValueStore::new();
        assert_eq!(store.now(), 0);
        assert_eq!(store.tick(), 1);
        assert_eq!(store.tick(), 2);
        assert_eq!(store.now(), 2);
    }
}
