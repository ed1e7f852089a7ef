//! One-time bootstrap token store.
//!
//! Tokens are random 128-bit values handed to operators as 32 lowercase hex
//! characters; only their SHA-256 hash is kept. All operations serialize on
//! a single mutex. When a persistence path is configured the full set is
//! rewritten atomically on every mutation and loaded at startup.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Token consumption policy; resolves the spec's open question in favor of
/// strict single use by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TokenPolicy {
    /// A token authorizes exactly one enrollment.
    SingleUse,
    /// An unexpired token may authorize repeated enrollments until its TTL
    /// elapses; `consumed_by_id` tracks the most recent consumer.
    Reusable,
}

/// Stored record, keyed by the hex SHA-256 of the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub expires_at: i64,
    pub consumed: bool,
    pub consumed_by_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing token")]
    Missing,

    #[error("missing workload id")]
    MissingId,

    #[error("invalid token")]
    Unknown,

    #[error("token expired")]
    Expired,

    #[error("token already consumed")]
    Consumed,

    #[error("token store persistence failed: {0}")]
    Persist(String),
}

pub struct TokenStore {
    tokens: Mutex<HashMap<String, TokenRecord>>,
    ttl: Duration,
    policy: TokenPolicy,
    path: Option<PathBuf>,
}

impl TokenStore {
    /// Opens the store, loading any persisted set from `path`.
    pub fn open(
        ttl: Duration,
        policy: TokenPolicy,
        path: Option<PathBuf>,
    ) -> io::Result<Self> {
        let tokens = match &path {
            Some(p) if p.exists() => {
                let data = std::fs::read(p)?;
                serde_json::from_slice(&data)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            }
            _ => HashMap::new(),
        };
        Ok(Self {
            tokens: Mutex::new(tokens),
            ttl,
            policy,
            path,
        })
    }

    /// Mints a fresh token. Returns the cleartext token and its expiry as a
    /// Unix timestamp; only the hash is retained.
    pub fn create(&self) -> Result<(String, i64), TokenError> {
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let hash = hash_token(&token);

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let expires_at = now + self.ttl.as_secs() as i64;

        let mut tokens = self.tokens.lock().expect("token store lock poisoned");
        tokens.retain(|_, rec| rec.expires_at > now);
        tokens.insert(
            hash,
            TokenRecord {
                expires_at,
                consumed: false,
                consumed_by_id: None,
                created_at: now,
            },
        );
        self.save_locked(&tokens)?;

        Ok((token, expires_at))
    }

    /// Consumes a token on behalf of workload `id`.
    pub fn consume(&self, token: &str, id: &str) -> Result<(), TokenError> {
        self.consume_at(token, id, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub(crate) fn consume_at(&self, token: &str, id: &str, now: i64) -> Result<(), TokenError> {
        if token.is_empty() {
            return Err(TokenError::Missing);
        }
        if id.is_empty() {
            return Err(TokenError::MissingId);
        }
        let hash = hash_token(token);

        let mut tokens = self.tokens.lock().expect("token store lock poisoned");
        let record = tokens.get_mut(&hash).ok_or(TokenError::Unknown)?;
        if now >= record.expires_at {
            return Err(TokenError::Expired);
        }
        if record.consumed && self.policy == TokenPolicy::SingleUse {
            return Err(TokenError::Consumed);
        }
        record.consumed = true;
        record.consumed_by_id = Some(id.to_string());
        self.save_locked(&tokens)?;
        Ok(())
    }

    /// Drops expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tokens = self.tokens.lock().expect("token store lock poisoned");
        let before = tokens.len();
        tokens.retain(|_, rec| rec.expires_at > now);
        let purged = before - tokens.len();
        if purged > 0 {
            if let Err(e) = self.save_locked(&tokens) {
                tracing::error!(error = %e, "failed to persist token purge");
            }
        }
        purged
    }

    /// Copies out the current record set.
    pub fn snapshot(&self) -> HashMap<String, TokenRecord> {
        self.tokens.lock().expect("token store lock poisoned").clone()
    }

    /// Rewrites the persisted set atomically (write-then-rename).
    fn save_locked(&self, tokens: &HashMap<String, TokenRecord>) -> Result<(), TokenError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let persist = || -> io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = serde_json::to_vec_pretty(tokens)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        persist().map_err(|e| TokenError::Persist(e.to_string()))
    }
}

/// Hex SHA-256 of a token's cleartext.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(policy: TokenPolicy) -> TokenStore {
        TokenStore::open(Duration::from_secs(600), policy, None).unwrap()
    }

    #[test]
    fn token_format_and_expiry() {
        let s = store(TokenPolicy::SingleUse);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let (token, expires_at) = s.create().unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!((expires_at - now - 600).abs() <= 1);
    }

    #[test]
    fn only_hashes_are_stored() {
        let s = store(TokenPolicy::SingleUse);
        let (token, _) = s.create().unwrap();
        let snapshot = s.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&hash_token(&token)));
        assert!(!snapshot.contains_key(&token));
    }

    #[test]
    fn single_use_rejects_second_consume() {
        let s = store(TokenPolicy::SingleUse);
        let (token, _) = s.create().unwrap();
        s.consume(&token, "c1").unwrap();
        // Same id or a different one: both are denied.
        assert!(matches!(s.consume(&token, "c1"), Err(TokenError::Consumed)));
        assert!(matches!(s.consume(&token, "c2"), Err(TokenError::Consumed)));
    }

    #[test]
    fn reusable_rebinds_until_expiry() {
        let s = store(TokenPolicy::Reusable);
        let (token, _) = s.create().unwrap();
        s.consume(&token, "c1").unwrap();
        s.consume(&token, "c2").unwrap();
        let snapshot = s.snapshot();
        let rec = snapshot.get(&hash_token(&token)).unwrap();
        assert_eq!(rec.consumed_by_id.as_deref(), Some("c2"));
    }

    #[test]
    fn unknown_and_expired_tokens_fail() {
        let s = store(TokenPolicy::SingleUse);
        assert!(matches!(s.consume("deadbeef", "c1"), Err(TokenError::Unknown)));
        assert!(matches!(s.consume("", "c1"), Err(TokenError::Missing)));

        let (token, expires_at) = s.create().unwrap();
        assert!(matches!(
            s.consume_at(&token, "c1", expires_at + 1),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn consumption_binds_the_workload_id() {
        let s = store(TokenPolicy::SingleUse);
        let (token, _) = s.create().unwrap();
        s.consume(&token, "c1").unwrap();
        let snapshot = s.snapshot();
        let rec = snapshot.values().next().unwrap();
        assert!(rec.consumed);
        assert_eq!(rec.consumed_by_id.as_deref(), Some("c1"));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let s = TokenStore::open(
            Duration::from_secs(600),
            TokenPolicy::SingleUse,
            Some(path.clone()),
        )
        .unwrap();
        let (a, _) = s.create().unwrap();
        let (b, _) = s.create().unwrap();
        s.consume(&a, "c1").unwrap();
        let before = s.snapshot();
        assert_eq!(before.len(), 2);
        drop(s);

        let reloaded = TokenStore::open(
            Duration::from_secs(600),
            TokenPolicy::SingleUse,
            Some(path),
        )
        .unwrap();
        assert_eq!(reloaded.snapshot(), before);
        // Consumed state survives the reload.
        assert!(matches!(reloaded.consume(&a, "c9"), Err(TokenError::Consumed)));
        reloaded.consume(&b, "c2").unwrap();
    }
}
