//! Channel construction toward the controller and connector.

use std::sync::Arc;

use tether_identity::spiffe::{TrustDomain, WorkloadRole};
use tether_tls::{
    build_tls_channel, client_config_bootstrap, client_config_mtls, root_store_from_pem, CertStore,
};
use tonic::transport::Channel;

use crate::AgentError;

/// Dials `addr` with only the pinned CA, presenting no client certificate.
/// Used for bootstrap enrollment; the server's SPIFFE role must match
/// `expected_role`.
pub async fn bootstrap_channel(
    addr: &str,
    ca_pem: &str,
    trust_domain: &TrustDomain,
    expected_role: WorkloadRole,
) -> Result<Channel, AgentError> {
    let roots = root_store_from_pem(ca_pem.as_bytes())?;
    let config = client_config_bootstrap(roots, trust_domain.clone(), expected_role)?;
    Ok(build_tls_channel(addr, config).await?)
}

/// Dials `addr` with mutual TLS, presenting the current workload
/// certificate from `store` at each handshake.
pub async fn mtls_channel(
    addr: &str,
    ca_pem: &str,
    trust_domain: &TrustDomain,
    expected_role: WorkloadRole,
    store: Arc<CertStore>,
) -> Result<Channel, AgentError> {
    let roots = root_store_from_pem(ca_pem.as_bytes())?;
    let config = client_config_mtls(roots, trust_domain.clone(), expected_role, store)?;
    Ok(build_tls_channel(addr, config).await?)
}
