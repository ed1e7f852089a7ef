//! Test harness for enrollment end-to-end tests.
//!
//! Uses tonic's pattern of constructing the client directly over the server
//! service (no network): the real `EnrollmentApi` handles every request.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use rcgen::KeyPair;
use tether_controller::grpc::EnrollmentApi;
use tether_controller::hub::Hub;
use tether_controller::state::{
    ConnectorRegistry, TokenPolicy, TokenStore, TunnelerDirectory, TunnelerPresence,
};
use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};
use tether_identity::{generate_self_signed_ca, Ca};
use tether_proto::enrollment_service_client::EnrollmentServiceClient;
use tether_proto::enrollment_service_server::EnrollmentServiceServer;
use time::Duration;

pub const TRUST_DOMAIN: &str = "mycorp.internal";

pub struct TestController {
    pub ca: Arc<Ca>,
    pub trust_domain: TrustDomain,
    pub tokens: Arc<TokenStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub presence: Arc<TunnelerPresence>,
    pub directory: Arc<TunnelerDirectory>,
    pub hub: Arc<Hub>,
}

impl TestController {
    pub fn new() -> Self {
        let (cert_pem, key_pem) =
            generate_self_signed_ca("tether test ca", Duration::days(1)).unwrap();
        let ca = Arc::new(Ca::load(&cert_pem, &key_pem).unwrap());
        Self {
            ca,
            trust_domain: TrustDomain::new(TRUST_DOMAIN).unwrap(),
            tokens: Arc::new(
                TokenStore::open(StdDuration::from_secs(600), TokenPolicy::SingleUse, None)
                    .unwrap(),
            ),
            connectors: Arc::new(ConnectorRegistry::new()),
            presence: Arc::new(TunnelerPresence::new()),
            directory: Arc::new(TunnelerDirectory::new()),
            hub: Hub::new(),
        }
    }

    pub fn api(&self) -> EnrollmentApi {
        self.api_with_tokens(Some(self.tokens.clone()))
    }

    pub fn api_with_tokens(&self, tokens: Option<Arc<TokenStore>>) -> EnrollmentApi {
        EnrollmentApi::new(
            self.ca.clone(),
            self.trust_domain.clone(),
            tokens,
            self.connectors.clone(),
            self.directory.clone(),
            self.hub.clone(),
            Duration::minutes(5),
            Duration::minutes(30),
        )
    }

    /// An enrollment client talking directly to the real service.
    pub fn client(
        &self,
    ) -> EnrollmentServiceClient<EnrollmentServiceServer<EnrollmentApi>> {
        EnrollmentServiceClient::new(EnrollmentServiceServer::new(self.api()))
    }

    /// Issues a workload leaf directly from the CA, as if previously
    /// enrolled; returns its DER for use as a peer certificate.
    pub fn peer_leaf(&self, role: WorkloadRole, id: &str) -> Vec<u8> {
        let key = fresh_key();
        let spiffe = SpiffeId::new(self.trust_domain.clone(), role, id).unwrap();
        let pem = self
            .ca
            .issue_workload_cert(&spiffe, &key.public_key_pem(), Duration::minutes(5), &[], &[])
            .unwrap();
        tether_identity::cert::parse_leaf(pem.as_bytes()).unwrap().der
    }
}

pub fn fresh_key() -> KeyPair {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap()
}

pub fn public_key_pem(key: &KeyPair) -> Vec<u8> {
    key.public_key_pem().into_bytes()
}
