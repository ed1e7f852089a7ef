//! Workload-side runtime shared by the connector and the tunneler.
//!
//! Covers the parts of the identity lifecycle every agent runs: bootstrap
//! enrollment against the controller, mTLS channel construction using the
//! rotating certificate store, and the background renewal loop.

mod dial;
mod enroll;
mod renew;

pub use dial::{bootstrap_channel, mtls_channel};
pub use enroll::{enroll_connector, enroll_tunneler, EnrolledIdentity, EnrollmentConfig};
pub use renew::{next_renewal, renewal_loop, RenewalTask};

use std::path::PathBuf;

/// Errors surfaced by the agent runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("enrollment timed out")]
    Timeout,

    #[error(transparent)]
    Tls(#[from] tether_tls::TlsError),

    #[error("RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("controller returned empty certificate")]
    EmptyCertificate,

    #[error("controller returned empty CA certificate")]
    EmptyCa,

    #[error("invalid internal CA: {0}")]
    InvalidCa(String),

    #[error("internal CA mismatch during renewal")]
    CaMismatch,

    #[error("issued certificate must contain exactly one SPIFFE ID")]
    UriSanCount,

    #[error("invalid certificate from controller: {0}")]
    BadCertificate(String),
}

/// Reads a systemd-style credential file (`$CREDENTIALS_DIRECTORY/<name>`).
///
/// Returns `None` when the credentials directory is not configured or the
/// file is missing; used as the fallback for `ENROLLMENT_TOKEN`.
pub fn read_credential(name: &str) -> Option<String> {
    let dir = std::env::var_os("CREDENTIALS_DIRECTORY")?;
    let path = PathBuf::from(dir).join(name);
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
