//! Authoritative tunneler directory (the allowlist).
//!
//! Additions are broadcast to connectors as deltas; a connecting connector
//! receives the full snapshot. Insertion order is preserved so snapshots
//! are stable.

use std::collections::HashMap;
use std::sync::RwLock;

use tether_proto::envelope::TunnelerEntry;

#[derive(Default)]
pub struct TunnelerDirectory {
    inner: RwLock<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
    by_id: HashMap<String, TunnelerEntry>,
    order: Vec<String>,
}

impl TunnelerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &str, spiffe_id: &str) {
        if id.is_empty() || spiffe_id.is_empty() {
            return;
        }
        let mut inner = self.inner.write().expect("directory lock poisoned");
        if !inner.by_id.contains_key(id) {
            inner.order.push(id.to_string());
        }
        inner.by_id.insert(
            id.to_string(),
            TunnelerEntry {
                id: id.to_string(),
                spiffe_id: spiffe_id.to_string(),
            },
        );
    }

    /// Full snapshot in insertion order.
    pub fn snapshot(&self) -> Vec<TunnelerEntry> {
        let inner = self.inner.read().expect("directory lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }
}
