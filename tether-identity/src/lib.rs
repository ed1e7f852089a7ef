//! Identity core for the tether control plane.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No logging
//!
//! It provides the SPIFFE identity model ([`TrustDomain`], [`WorkloadRole`],
//! [`SpiffeId`]), the internal certificate authority ([`ca::Ca`]), and
//! certificate parsing helpers ([`cert`]). The TLS plumbing that consumes
//! these types lives in `tether-tls`.

pub mod ca;
pub mod cert;
pub mod spiffe;

pub use ca::{generate_self_signed_ca, validate_public_key_pem, Ca, CaError};
pub use cert::{ca_der_equal, parse_leaf, validate_ca_pem, CertParseError, LeafInfo};
pub use spiffe::{SpiffeError, SpiffeId, TrustDomain, WorkloadRole};
