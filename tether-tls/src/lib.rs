//! SPIFFE-aware TLS plumbing shared by the controller, connector, and
//! tunneler.
//!
//! Provides the rotating certificate store, client/server rustls
//! configuration with SPIFFE peer verification, the TLS accept loop with
//! peer-certificate propagation into gRPC request extensions, and the
//! authentication interceptor that gates every RPC.

mod channel;
mod config;
mod interceptor;
mod listen;
mod store;
mod verify;

pub use channel::build_tls_channel;
pub use config::{
    client_config_bootstrap, client_config_mtls, server_config_optional_mtls,
    server_config_require_mtls,
};
pub use interceptor::{
    peer_identity, require_identity, require_identity_with_allowlist, Allowlist, PeerIdentity,
};
pub use listen::{tls_incoming, TlsConnectInfo, TlsConnection};
pub use store::{ActiveCert, CertStore};
pub use verify::{root_store_from_pem, verify_peer_spiffe, SpiffeServerVerifier};

/// Errors surfaced by the TLS layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error("failed to parse root CA PEM")]
    BadRootPem,

    #[error("certificate PEM contained no certificates")]
    EmptyCertChain,

    #[error("invalid certificate: {0}")]
    Cert(#[from] tether_identity::CertParseError),

    #[error("peer verification failed: {0}")]
    Spiffe(#[from] tether_identity::SpiffeError),

    #[error("exactly one SPIFFE ID is required")]
    UriSanCount,

    #[error("invalid address: {0}")]
    Address(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("failed to build verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
