//! rustls configuration builders.
//!
//! All configurations pin TLS 1.3 as the floor and verify chains against
//! the internal CA only. The controller's listener accepts connections
//! without a client certificate (enrollment authorizes via token instead);
//! the connector's inbound listener requires and verifies one.

use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tether_identity::spiffe::{TrustDomain, WorkloadRole};

use crate::store::CertStore;
use crate::verify::{provider, SpiffeServerVerifier};
use crate::TlsError;

static TLS13: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Server configuration with optional client authentication
/// (`VerifyClientCertIfGiven`): presented certificates must chain to the
/// internal CA, but connections without one are admitted so bootstrap
/// enrollment can run on the same listener. Per-method enforcement happens
/// in the authentication interceptor.
pub fn server_config_optional_mtls(
    roots: RootCertStore,
    store: Arc<CertStore>,
) -> Result<ServerConfig, TlsError> {
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .allow_unauthenticated()
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS13)?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(store);

    Ok(config)
}

/// Server configuration requiring a verified client certificate
/// (`RequireAndVerifyClientCert`). Used on the connector's inbound listener.
pub fn server_config_require_mtls(
    roots: RootCertStore,
    store: Arc<CertStore>,
) -> Result<ServerConfig, TlsError> {
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS13)?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(store);

    Ok(config)
}

/// Client configuration for bootstrap enrollment: the caller holds only the
/// pinned CA and presents no client certificate.
pub fn client_config_bootstrap(
    roots: RootCertStore,
    trust_domain: TrustDomain,
    expected_role: WorkloadRole,
) -> Result<ClientConfig, TlsError> {
    let verifier = SpiffeServerVerifier::new(roots, trust_domain, expected_role)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS13)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}

/// Client configuration for authenticated calls: presents the current
/// workload certificate from the store on every handshake, so a renewal
/// swap takes effect on the next dial without rebuilding the config.
pub fn client_config_mtls(
    roots: RootCertStore,
    trust_domain: TrustDomain,
    expected_role: WorkloadRole,
    store: Arc<CertStore>,
) -> Result<ClientConfig, TlsError> {
    let verifier = SpiffeServerVerifier::new(roots, trust_domain, expected_role)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(TLS13)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(store);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ActiveCert;
    use crate::verify::root_store_from_pem;
    use tether_identity::ca::{generate_self_signed_ca, Ca};
    use tether_identity::spiffe::SpiffeId;
    use time::Duration;

    fn fixtures() -> (Ca, String, Arc<CertStore>) {
        let (ca_pem, ca_key) = generate_self_signed_ca("config test ca", Duration::days(1)).unwrap();
        let ca = Ca::load(&ca_pem, &ca_key).unwrap();

        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let id = SpiffeId::new(td, WorkloadRole::Connector, "c1").unwrap();
        let pem = ca
            .issue_workload_cert(&id, &key.public_key_pem(), Duration::minutes(5), &[], &[])
            .unwrap();
        let store = CertStore::new(ActiveCert::from_pem_and_key(&pem, key.serialize_der()).unwrap());

        (ca, ca_pem, store)
    }

    #[test]
    fn server_configs_build() {
        let (_, ca_pem, store) = fixtures();
        let roots = root_store_from_pem(ca_pem.as_bytes()).unwrap();
        assert!(server_config_optional_mtls(roots.clone(), store.clone()).is_ok());
        assert!(server_config_require_mtls(roots, store).is_ok());
    }

    #[test]
    fn client_configs_build() {
        let (_, ca_pem, store) = fixtures();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let roots = root_store_from_pem(ca_pem.as_bytes()).unwrap();
        assert!(client_config_bootstrap(
            roots.clone(),
            td.clone(),
            WorkloadRole::Controller
        )
        .is_ok());
        assert!(client_config_mtls(roots, td, WorkloadRole::Controller, store).is_ok());
    }
}
