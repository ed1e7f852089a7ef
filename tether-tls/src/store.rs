//! In-memory rotating certificate store.
//!
//! Renewal must be hot: swapping the certificate must not close existing
//! streams or force reconnection. The store keeps the active certificate
//! behind an [`ArcSwap`] so handshakes read the current material with a
//! wait-free load and `update` replaces it atomically. In-flight TLS
//! sessions keep their negotiated parameters until the peer terminates.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use time::{Duration, OffsetDateTime};

use crate::TlsError;

/// One active workload certificate with its parsed validity window.
pub struct ActiveCert {
    certified: Arc<CertifiedKey>,
    cert_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl ActiveCert {
    /// Builds an active certificate from a PEM chain and a PKCS#8 DER key.
    ///
    /// The first certificate in the chain is the leaf; its validity window
    /// is captured for renewal scheduling.
    pub fn from_pem_and_key(cert_pem: &str, key_pkcs8_der: Vec<u8>) -> Result<Self, TlsError> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<_, _>>()?;
        let leaf_der = chain.first().ok_or(TlsError::EmptyCertChain)?;
        let leaf = tether_identity::cert::parse_leaf_der(leaf_der)?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8_der));
        let signer = rustls::crypto::ring::sign::any_supported_type(&key)?;

        Ok(Self {
            certified: Arc::new(CertifiedKey::new(chain, signer)),
            cert_pem: cert_pem.to_string(),
            not_before: leaf.not_before,
            not_after: leaf.not_after,
        })
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

/// Single-writer/many-reader store for the current workload certificate.
///
/// Implements both rustls resolver traits so the same store serves as the
/// handshake callback on servers (`get_server_certificate`) and clients
/// (`get_client_certificate`).
pub struct CertStore {
    current: ArcSwap<ActiveCert>,
}

impl CertStore {
    pub fn new(initial: ActiveCert) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
        })
    }

    /// Atomically replaces the active certificate. Lock-free for readers;
    /// existing TLS sessions are unaffected.
    pub fn update(&self, next: ActiveCert) {
        self.current.store(Arc::new(next));
    }

    /// Expiry of the current certificate.
    pub fn not_after(&self) -> OffsetDateTime {
        self.current.load().not_after
    }

    /// Total validity window of the current certificate.
    pub fn total_ttl(&self) -> Duration {
        let cur = self.current.load();
        cur.not_after - cur.not_before
    }

    /// PEM form of the current certificate.
    pub fn cert_pem(&self) -> String {
        self.current.load().cert_pem.clone()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load().certified.clone())
    }
}

impl ResolvesClientCert for CertStore {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load().certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("not_after", &self.not_after())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_identity::ca::{generate_self_signed_ca, Ca};
    use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};

    fn issue(ca: &Ca, ttl: Duration) -> (String, Vec<u8>) {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let id = SpiffeId::new(td, WorkloadRole::Connector, "c1").unwrap();
        let pem = ca
            .issue_workload_cert(&id, &key.public_key_pem(), ttl, &[], &[])
            .unwrap();
        (pem, key.serialize_der())
    }

    fn test_ca() -> Ca {
        let (cert, key) = generate_self_signed_ca("store test ca", Duration::days(1)).unwrap();
        Ca::load(&cert, &key).unwrap()
    }

    #[test]
    fn swap_replaces_cert_and_expiry() {
        let ca = test_ca();
        let (pem_a, key_a) = issue(&ca, Duration::minutes(5));
        let (pem_b, key_b) = issue(&ca, Duration::minutes(30));

        let store = CertStore::new(ActiveCert::from_pem_and_key(&pem_a, key_a).unwrap());
        let first_expiry = store.not_after();
        let first_key = ResolvesClientCert::resolve(&*store, &[], &[]).unwrap();

        store.update(ActiveCert::from_pem_and_key(&pem_b, key_b).unwrap());
        assert!(store.not_after() > first_expiry);
        assert_eq!(store.cert_pem(), pem_b);

        let second_key = ResolvesClientCert::resolve(&*store, &[], &[]).unwrap();
        assert!(!Arc::ptr_eq(&first_key, &second_key));
    }

    #[test]
    fn total_ttl_includes_backdating() {
        let ca = test_ca();
        let (pem, key) = issue(&ca, Duration::minutes(5));
        let store = CertStore::new(ActiveCert::from_pem_and_key(&pem, key).unwrap());
        // 5 minutes of TTL plus the one-minute NotBefore skew.
        assert!(store.total_ttl() >= Duration::minutes(6) - Duration::seconds(5));
        assert!(store.total_ttl() <= Duration::minutes(6) + Duration::seconds(5));
    }

    #[test]
    fn rejects_empty_chain() {
        assert!(matches!(
            ActiveCert::from_pem_and_key("", vec![1, 2, 3]),
            Err(TlsError::EmptyCertChain)
        ));
    }
}
