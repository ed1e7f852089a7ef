//! SPIFFE peer verification.
//!
//! Clients verify servers in two steps: the webpki chain check against the
//! pinned internal CA, then a SPIFFE check on the end entity (exactly one
//! URI SAN, matching trust domain, expected role). Servers get the chain
//! check from their client-certificate verifier and perform the SPIFFE
//! checks in the authentication interceptor.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};

use crate::TlsError;

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a root store from a PEM bundle (the pinned internal CA).
pub fn root_store_from_pem(ca_pem: &[u8]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|_| TlsError::BadRootPem)?;
        roots.add(cert).map_err(|_| TlsError::BadRootPem)?;
    }
    if roots.is_empty() {
        return Err(TlsError::BadRootPem);
    }
    Ok(roots)
}

/// Validates the SPIFFE identity carried by a peer's leaf certificate.
///
/// Requires exactly one URI SAN with the `spiffe` scheme in the expected
/// trust domain; when `expected_role` is set, the path's role segment must
/// match it.
pub fn verify_peer_spiffe(
    leaf_der: &[u8],
    trust_domain: &TrustDomain,
    expected_role: Option<WorkloadRole>,
) -> Result<SpiffeId, TlsError> {
    let leaf = tether_identity::cert::parse_leaf_der(leaf_der)?;
    if leaf.uri_sans.len() != 1 {
        return Err(TlsError::UriSanCount);
    }
    let spiffe_id = SpiffeId::parse_in_domain(&leaf.uri_sans[0], trust_domain)?;
    if let Some(role) = expected_role {
        if spiffe_id.role() != role {
            return Err(TlsError::Spiffe(
                tether_identity::SpiffeError::UnknownRole(spiffe_id.role().to_string()),
            ));
        }
    }
    Ok(spiffe_id)
}

/// Server-certificate verifier that chains webpki verification against the
/// pinned internal CA with a SPIFFE identity check on the end entity.
#[derive(Debug)]
pub struct SpiffeServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    trust_domain: TrustDomain,
    expected_role: WorkloadRole,
}

impl SpiffeServerVerifier {
    pub fn new(
        roots: RootCertStore,
        trust_domain: TrustDomain,
        expected_role: WorkloadRole,
    ) -> Result<Arc<Self>, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        Ok(Arc::new(Self {
            inner,
            trust_domain,
            expected_role,
        }))
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        verify_peer_spiffe(
            end_entity.as_ref(),
            &self.trust_domain,
            Some(self.expected_role),
        )
        .map_err(|e| {
            tracing::warn!(error = %e, "peer SPIFFE verification failed");
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        })?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
