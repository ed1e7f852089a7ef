//! Enrollment gRPC service implementation.
//!
//! `EnrollConnector` and `EnrollTunneler` run without a client certificate
//! and authorize via the one-time bootstrap token; `Renew` requires an
//! authenticated mTLS peer and re-issues under the peer's own identity.

use std::net::IpAddr;
use std::sync::Arc;

use tether_identity::spiffe::{valid_workload_id, SpiffeId, TrustDomain, WorkloadRole};
use tether_identity::{cert, validate_public_key_pem, Ca};
use tether_proto::envelope::{ControlEvent, TunnelerEntry};
use tether_proto::{enrollment_service_server::EnrollmentService, EnrollRequest, EnrollResponse};
use tether_tls::peer_identity;
use time::Duration;
use tonic::{Request, Response, Status};

use crate::hub::Hub;
use crate::state::{ConnectorRegistry, TokenError, TokenStore, TunnelerDirectory};

pub struct EnrollmentApi {
    ca: Arc<Ca>,
    trust_domain: TrustDomain,
    tokens: Option<Arc<TokenStore>>,
    connectors: Arc<ConnectorRegistry>,
    directory: Arc<TunnelerDirectory>,
    hub: Arc<Hub>,
    connector_ttl: Duration,
    tunneler_ttl: Duration,
}

impl EnrollmentApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ca: Arc<Ca>,
        trust_domain: TrustDomain,
        tokens: Option<Arc<TokenStore>>,
        connectors: Arc<ConnectorRegistry>,
        directory: Arc<TunnelerDirectory>,
        hub: Arc<Hub>,
        connector_ttl: Duration,
        tunneler_ttl: Duration,
    ) -> Self {
        Self {
            ca,
            trust_domain,
            tokens,
            connectors,
            directory,
            hub,
            connector_ttl,
            tunneler_ttl,
        }
    }

    fn consume_token(&self, token: &str, id: &str) -> Result<(), Status> {
        let Some(tokens) = &self.tokens else {
            return Err(Status::failed_precondition("token service unavailable"));
        };
        tokens.consume(token, id).map_err(|e| match e {
            TokenError::Persist(msg) => {
                tracing::error!(error = %msg, "token store persistence failed");
                Status::internal("token store failure")
            }
            other => {
                tracing::warn!(id = %id, error = %other, "enrollment token rejected");
                Status::permission_denied("invalid enrollment token")
            }
        })
    }

    /// Checks the request's public key parses, returning it as a PEM str.
    fn public_key<'a>(&self, req: &'a EnrollRequest) -> Result<&'a str, Status> {
        let pem = std::str::from_utf8(&req.public_key)
            .map_err(|_| Status::invalid_argument("invalid public key"))?;
        validate_public_key_pem(pem)
            .map_err(|e| Status::invalid_argument(format!("invalid public key: {e}")))?;
        Ok(pem)
    }

    /// Issues a leaf and logs its serial and expiry.
    fn issue(
        &self,
        scope: &'static str,
        spiffe_id: &SpiffeId,
        public_key_pem: &str,
        ttl: Duration,
        dns_names: &[String],
        ip_addrs: &[IpAddr],
    ) -> Result<Vec<u8>, Status> {
        let pem = self
            .ca
            .issue_workload_cert(spiffe_id, public_key_pem, ttl, dns_names, ip_addrs)
            .map_err(|e| Status::internal(format!("certificate issuance failed: {e}")))?;

        match cert::parse_leaf(pem.as_bytes()) {
            Ok(leaf) => tracing::info!(
                scope,
                spiffe = %spiffe_id,
                serial = %leaf.serial,
                not_after = %leaf.not_after,
                "issued certificate"
            ),
            Err(e) => tracing::warn!(scope, spiffe = %spiffe_id, error = %e, "issued unparseable certificate"),
        }

        Ok(pem.into_bytes())
    }

    fn response(&self, certificate: Vec<u8>) -> Response<EnrollResponse> {
        Response::new(EnrollResponse {
            certificate,
            ca_certificate: self.ca.cert_pem().as_bytes().to_vec(),
        })
    }
}

#[tonic::async_trait]
impl EnrollmentService for EnrollmentApi {
    async fn enroll_connector(
        &self,
        request: Request<EnrollRequest>,
    ) -> Result<Response<EnrollResponse>, Status> {
        let req = request.into_inner();

        if !valid_workload_id(&req.id) {
            return Err(Status::invalid_argument("invalid connector id"));
        }
        if req.private_ip.is_empty() {
            return Err(Status::invalid_argument("missing private ip"));
        }
        if req.version.is_empty() {
            return Err(Status::invalid_argument("missing version"));
        }
        let public_key = self.public_key(&req)?;

        self.consume_token(&req.token, &req.id)?;

        let spiffe_id = SpiffeId::new(self.trust_domain.clone(), WorkloadRole::Connector, &req.id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        // An unparseable private IP is not fatal; the IP SAN is omitted.
        let ip_addrs: Vec<IpAddr> = req.private_ip.parse().into_iter().collect();

        let certificate = self.issue(
            "enroll-connector",
            &spiffe_id,
            public_key,
            self.connector_ttl,
            &[],
            &ip_addrs,
        )?;

        tracing::info!(
            role = "connector",
            id = %req.id,
            private_ip = %req.private_ip,
            version = %req.version,
            "enrollment"
        );
        self.connectors.register(&req.id, &req.private_ip, &req.version);

        Ok(self.response(certificate))
    }

    async fn enroll_tunneler(
        &self,
        request: Request<EnrollRequest>,
    ) -> Result<Response<EnrollResponse>, Status> {
        let req = request.into_inner();

        if !valid_workload_id(&req.id) {
            return Err(Status::invalid_argument("invalid tunneler id"));
        }
        if req.token.is_empty() {
            return Err(Status::invalid_argument("missing enrollment token"));
        }
        let public_key = self.public_key(&req)?;

        self.consume_token(&req.token, &req.id)?;

        let spiffe_id = SpiffeId::new(self.trust_domain.clone(), WorkloadRole::Tunneler, &req.id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let certificate = self.issue(
            "enroll-tunneler",
            &spiffe_id,
            public_key,
            self.tunneler_ttl,
            &[],
            &[],
        )?;

        tracing::info!(
            role = "tunneler",
            id = %req.id,
            private_ip = "",
            version = %req.version,
            "enrollment"
        );

        // Announce the new identity to every connected connector.
        self.directory.add(&req.id, &spiffe_id.to_string());
        self.hub.publish(
            &ControlEvent::TunnelerAllow(TunnelerEntry {
                id: req.id.clone(),
                spiffe_id: spiffe_id.to_string(),
            })
            .into_message(),
        );

        Ok(self.response(certificate))
    }

    async fn renew(
        &self,
        request: Request<EnrollRequest>,
    ) -> Result<Response<EnrollResponse>, Status> {
        // No role restriction here: any workload renews under its own
        // authenticated identity.
        let peer = peer_identity(request.extensions(), &self.trust_domain, &[])?;
        let req = request.into_inner();

        if !valid_workload_id(&req.id) {
            return Err(Status::invalid_argument("invalid id"));
        }
        let public_key = self.public_key(&req)?;

        if peer.spiffe_id.workload_id() != req.id {
            tracing::warn!(
                peer = %peer.spiffe_id,
                requested = %req.id,
                "cross-identity renewal denied"
            );
            return Err(Status::permission_denied("id mismatch for renewal"));
        }

        let role = peer.role();
        let spiffe_id = SpiffeId::new(self.trust_domain.clone(), role, &req.id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (ttl, ip_addrs) = match role {
            WorkloadRole::Connector => {
                let ips: Vec<IpAddr> = self
                    .connectors
                    .get(&req.id)
                    .and_then(|rec| rec.private_ip.parse().ok())
                    .into_iter()
                    .collect();
                (self.connector_ttl, ips)
            }
            _ => (self.tunneler_ttl, Vec::new()),
        };

        let certificate = self.issue("renew", &spiffe_id, public_key, ttl, &[], &ip_addrs)?;

        Ok(self.response(certificate))
    }
}
