//! Controller state: token store, presence registries, and the tunneler
//! directory.

mod connectors;
mod directory;
mod token_store;
mod tunnelers;

pub use connectors::{ConnectorRecord, ConnectorRegistry};
pub use directory::TunnelerDirectory;
pub use token_store::{TokenError, TokenPolicy, TokenRecord, TokenStore};
pub use tunnelers::{TunnelerPresence, TunnelerRecord};

use time::{Duration, OffsetDateTime};

/// A record whose heartbeat is older than this is classified offline.
pub const PRESENCE_THRESHOLD: Duration = Duration::seconds(30);

/// Classifies a registry record as `ONLINE` or `OFFLINE` at `now`.
pub fn presence_status(now: OffsetDateTime, last_seen: OffsetDateTime) -> &'static str {
    if now - last_seen < PRESENCE_THRESHOLD {
        "ONLINE"
    } else {
        "OFFLINE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_threshold_is_thirty_seconds() {
        let now = OffsetDateTime::from_unix_timestamp(1_000_000).unwrap();
        assert_eq!(presence_status(now, now), "ONLINE");
        assert_eq!(presence_status(now, now - Duration::seconds(29)), "ONLINE");
        assert_eq!(presence_status(now, now - Duration::seconds(30)), "OFFLINE");
        assert_eq!(presence_status(now, now - Duration::seconds(45)), "OFFLINE");
    }
}
