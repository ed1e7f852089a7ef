//! Connector presence registry.

use std::collections::HashMap;
use std::sync::RwLock;

use time::OffsetDateTime;

/// One registered connector. `last_seen` advances on every heartbeat;
/// records are retained after going offline.
#[derive(Debug, Clone)]
pub struct ConnectorRecord {
    pub id: String,
    pub private_ip: String,
    pub version: String,
    pub last_seen: OffsetDateTime,
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, ConnectorRecord>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a connector at enrollment time.
    pub fn register(&self, id: &str, private_ip: &str, version: &str) {
        let mut connectors = self.connectors.write().expect("registry lock poisoned");
        let rec = connectors.entry(id.to_string()).or_insert_with(|| ConnectorRecord {
            id: id.to_string(),
            private_ip: String::new(),
            version: String::new(),
            last_seen: OffsetDateTime::UNIX_EPOCH,
        });
        rec.private_ip = private_ip.to_string();
        rec.version = version.to_string();
        rec.last_seen = OffsetDateTime::now_utc();
    }

    /// Advances `last_seen`; an empty `private_ip` leaves the stored one
    /// untouched.
    pub fn record_heartbeat(&self, id: &str, private_ip: &str) {
        if id.is_empty() {
            return;
        }
        let mut connectors = self.connectors.write().expect("registry lock poisoned");
        let rec = connectors.entry(id.to_string()).or_insert_with(|| ConnectorRecord {
            id: id.to_string(),
            private_ip: String::new(),
            version: String::new(),
            last_seen: OffsetDateTime::UNIX_EPOCH,
        });
        if !private_ip.is_empty() {
            rec.private_ip = private_ip.to_string();
        }
        rec.last_seen = OffsetDateTime::now_utc();
    }

    pub fn get(&self, id: &str) -> Option<ConnectorRecord> {
        self.connectors
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Defensive snapshot sorted by `last_seen` descending.
    pub fn list(&self) -> Vec<ConnectorRecord> {
        let mut out: Vec<ConnectorRecord> = self
            .connectors
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }
}
