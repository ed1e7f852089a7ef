//! Tunneler presence registry, fed by relayed heartbeats.

use std::collections::HashMap;
use std::sync::RwLock;

use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct TunnelerRecord {
    pub id: String,
    pub spiffe_id: String,
    pub connector_id: String,
    pub last_seen: OffsetDateTime,
}

#[derive(Default)]
pub struct TunnelerPresence {
    tunnelers: RwLock<HashMap<String, TunnelerRecord>>,
}

impl TunnelerPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a tunneler record; empty fields leave stored values intact.
    pub fn record(&self, id: &str, spiffe_id: &str, connector_id: &str) {
        if id.is_empty() {
            return;
        }
        let mut tunnelers = self.tunnelers.write().expect("registry lock poisoned");
        let rec = tunnelers.entry(id.to_string()).or_insert_with(|| TunnelerRecord {
            id: id.to_string(),
            spiffe_id: String::new(),
            connector_id: String::new(),
            last_seen: OffsetDateTime::UNIX_EPOCH,
        });
        if !spiffe_id.is_empty() {
            rec.spiffe_id = spiffe_id.to_string();
        }
        if !connector_id.is_empty() {
            rec.connector_id = connector_id.to_string();
        }
        rec.last_seen = OffsetDateTime::now_utc();
    }

    pub fn get(&self, id: &str) -> Option<TunnelerRecord> {
        self.tunnelers
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Defensive snapshot sorted by `last_seen` descending.
    pub fn list(&self) -> Vec<TunnelerRecord> {
        let mut out: Vec<TunnelerRecord> = self
            .tunnelers
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_upserts_and_retains_fields() {
        let presence = TunnelerPresence::new();
        presence.record("t1", "spiffe://td/tunneler/t1", "c1");
        presence.record("t1", "", "");
        let rec = presence.get("t1").unwrap();
        assert_eq!(rec.spiffe_id, "spiffe://td/tunneler/t1");
        assert_eq!(rec.connector_id, "c1");
    }

    #[test]
    fn empty_id_is_ignored() {
        let presence = TunnelerPresence::new();
        presence.record("", "spiffe://td/tunneler/x", "c1");
        assert!(presence.list().is_empty());
    }
}
