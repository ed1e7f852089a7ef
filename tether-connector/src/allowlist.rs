//! Local tunneler allowlist cache.
//!
//! Replicated from the controller: a full snapshot on connect, additive
//! deltas afterwards. Consulted by the inbound server's interceptor before
//! any tunneler RPC reaches a handler.

use std::collections::HashSet;
use std::sync::RwLock;

use tether_identity::spiffe::SpiffeId;
use tether_proto::envelope::TunnelerEntry;

#[derive(Default)]
pub struct TunnelerAllowlist {
    by_spiffe: RwLock<HashSet<String>>,
}

impl TunnelerAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache with a fresh snapshot.
    pub fn replace(&self, entries: &[TunnelerEntry]) {
        let next: HashSet<String> = entries
            .iter()
            .filter(|e| !e.spiffe_id.is_empty())
            .map(|e| e.spiffe_id.clone())
            .collect();
        *self.by_spiffe.write().expect("allowlist lock poisoned") = next;
    }

    /// Applies one additive delta.
    pub fn add(&self, spiffe_id: &str) {
        if spiffe_id.is_empty() {
            return;
        }
        self.by_spiffe
            .write()
            .expect("allowlist lock poisoned")
            .insert(spiffe_id.to_string());
    }

    pub fn contains(&self, spiffe_id: &str) -> bool {
        self.by_spiffe
            .read()
            .expect("allowlist lock poisoned")
            .contains(spiffe_id)
    }

    pub fn len(&self) -> usize {
        self.by_spiffe.read().expect("allowlist lock poisoned").len()
    }
}

impl tether_tls::Allowlist for TunnelerAllowlist {
    fn allowed(&self, spiffe_id: &SpiffeId) -> bool {
        self.contains(&spiffe_id.to_string())
    }
}
