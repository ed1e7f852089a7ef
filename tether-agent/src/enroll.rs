//! Bootstrap enrollment against the controller.
//!
//! The workload generates a fresh P-256 key pair in memory, dials the
//! controller with only the pinned CA (no client certificate), and trades
//! its one-time token for a workload certificate. The private key never
//! crosses the wire.

use std::sync::Arc;
use std::time::Duration;

use rcgen::KeyPair;
use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};
use tether_identity::{cert, validate_ca_pem};
use tether_proto::enrollment_service_client::EnrollmentServiceClient;
use tether_proto::EnrollRequest;
use tether_tls::{ActiveCert, CertStore};

use crate::dial::bootstrap_channel;
use crate::AgentError;

/// Wall-clock budget for the whole enrollment exchange.
const ENROLLMENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Inputs for one enrollment attempt. No `Debug` implementation: the
/// bootstrap token must not reach logs.
#[derive(Clone)]
pub struct EnrollmentConfig {
    pub controller_addr: String,
    pub trust_domain: TrustDomain,
    pub id: String,
    pub token: String,
    /// Pinned controller CA used to authenticate the bootstrap dial.
    pub controller_ca_pem: String,
    /// Connector private IP, recorded in the registry and placed in the
    /// leaf as an IP SAN. Unused for tunnelers.
    pub private_ip: Option<String>,
    /// Workload software version, recorded in the registry.
    pub version: String,
}

/// A freshly enrolled workload identity.
pub struct EnrolledIdentity {
    pub spiffe_id: SpiffeId,
    /// Certificate store seeded with the issued leaf; renewal swaps into it.
    pub store: Arc<CertStore>,
    /// The internal CA as returned by the controller; pinned for renewals.
    pub ca_pem: String,
}

/// Enrolls a connector.
pub async fn enroll_connector(config: &EnrollmentConfig) -> Result<EnrolledIdentity, AgentError> {
    enroll(config, WorkloadRole::Connector).await
}

/// Enrolls a tunneler.
pub async fn enroll_tunneler(config: &EnrollmentConfig) -> Result<EnrolledIdentity, AgentError> {
    enroll(config, WorkloadRole::Tunneler).await
}

async fn enroll(
    config: &EnrollmentConfig,
    role: WorkloadRole,
) -> Result<EnrolledIdentity, AgentError> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| AgentError::KeyGeneration(e.to_string()))?;

    let request = EnrollRequest {
        id: config.id.clone(),
        public_key: key.public_key_pem().into_bytes(),
        token: config.token.clone(),
        private_ip: config.private_ip.clone().unwrap_or_default(),
        version: config.version.clone(),
    };

    let response = tokio::time::timeout(ENROLLMENT_TIMEOUT, async {
        let channel = bootstrap_channel(
            &config.controller_addr,
            &config.controller_ca_pem,
            &config.trust_domain,
            WorkloadRole::Controller,
        )
        .await?;

        let mut client = EnrollmentServiceClient::new(channel);
        let response = match role {
            WorkloadRole::Connector => client.enroll_connector(request).await,
            WorkloadRole::Tunneler => client.enroll_tunneler(request).await,
            WorkloadRole::Controller => unreachable!("controllers do not enroll"),
        };
        response.map(|r| r.into_inner()).map_err(AgentError::from)
    })
    .await
    .map_err(|_| AgentError::Timeout)??;

    if response.certificate.is_empty() {
        return Err(AgentError::EmptyCertificate);
    }
    if response.ca_certificate.is_empty() {
        return Err(AgentError::EmptyCa);
    }

    validate_ca_pem(&response.ca_certificate)
        .map_err(|e| AgentError::InvalidCa(e.to_string()))?;

    let cert_pem = std::str::from_utf8(&response.certificate)
        .map_err(|e| AgentError::BadCertificate(e.to_string()))?;
    let leaf =
        cert::parse_leaf(cert_pem.as_bytes()).map_err(|e| AgentError::BadCertificate(e.to_string()))?;
    if leaf.uri_sans.len() != 1 {
        return Err(AgentError::UriSanCount);
    }
    let spiffe_id = SpiffeId::parse_in_domain(&leaf.uri_sans[0], &config.trust_domain)
        .map_err(|e| AgentError::BadCertificate(e.to_string()))?;

    let store = CertStore::new(ActiveCert::from_pem_and_key(cert_pem, key.serialize_der())?);
    let ca_pem = String::from_utf8(response.ca_certificate)
        .map_err(|e| AgentError::InvalidCa(e.to_string()))?;

    tracing::info!(spiffe = %spiffe_id, not_after = %store.not_after(), "enrolled");

    Ok(EnrolledIdentity {
        spiffe_id,
        store,
        ca_pem,
    })
}
