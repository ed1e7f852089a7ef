//! Authentication interceptor for inbound RPCs.
//!
//! Every authenticated service passes each request through
//! [`require_identity`], which reads the peer's verified leaf certificate
//! from the connection info, performs the SPIFFE checks (exactly one URI
//! SAN, `spiffe` scheme, matching trust domain, two-segment path, allowed
//! role), and publishes the resulting [`PeerIdentity`] into the request
//! extensions for handlers. Enrollment RPCs bypass this entirely; they
//! authorize via the one-time token instead.
//!
//! The connector's inbound variant additionally consults a local
//! [`Allowlist`] and rejects tunneler peers that are not in it.

use std::sync::Arc;

use tonic::{Request, Status};

use tether_identity::spiffe::{SpiffeError, SpiffeId, TrustDomain, WorkloadRole};

use crate::listen::TlsConnectInfo;

/// Verified peer identity, published into request extensions.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub spiffe_id: SpiffeId,
    pub serial: String,
}

impl PeerIdentity {
    pub fn role(&self) -> WorkloadRole {
        self.spiffe_id.role()
    }
}

/// Local decision hook for admitting tunneler peers.
pub trait Allowlist: Send + Sync + 'static {
    fn allowed(&self, spiffe_id: &SpiffeId) -> bool;
}

/// Extracts and validates the peer's SPIFFE identity from request
/// extensions.
///
/// An empty `allowed_roles` slice admits every known role.
pub fn peer_identity(
    extensions: &tonic::Extensions,
    trust_domain: &TrustDomain,
    allowed_roles: &[WorkloadRole],
) -> Result<PeerIdentity, Status> {
    let info = extensions
        .get::<TlsConnectInfo>()
        .ok_or_else(|| Status::unauthenticated("connection is not using TLS"))?;

    let leaf_der = info
        .peer_leaf
        .as_ref()
        .ok_or_else(|| Status::unauthenticated("no peer certificates presented"))?;

    let leaf = tether_identity::cert::parse_leaf_der(leaf_der)
        .map_err(|_| Status::unauthenticated("malformed peer certificate"))?;

    if leaf.uri_sans.len() != 1 {
        return Err(Status::unauthenticated("exactly one SPIFFE ID is required"));
    }

    let spiffe_id =
        SpiffeId::parse_in_domain(&leaf.uri_sans[0], trust_domain).map_err(|e| {
            tracing::warn!(
                spiffe = %leaf.uri_sans[0],
                serial = %leaf.serial,
                error = %e,
                "rejected peer identity"
            );
            match e {
                SpiffeError::WrongScheme | SpiffeError::BadPath => {
                    Status::unauthenticated("invalid SPIFFE identity")
                }
                _ => Status::permission_denied("invalid SPIFFE identity"),
            }
        })?;

    if !allowed_roles.is_empty() && !allowed_roles.contains(&spiffe_id.role()) {
        tracing::warn!(spiffe = %spiffe_id, serial = %leaf.serial, "peer role not permitted");
        return Err(Status::permission_denied("role not permitted"));
    }

    tracing::debug!(spiffe = %spiffe_id, serial = %leaf.serial, "mtls peer");

    Ok(PeerIdentity {
        spiffe_id,
        serial: leaf.serial,
    })
}

/// Interceptor enforcing a verified SPIFFE identity with one of
/// `allowed_roles`.
pub fn require_identity(
    trust_domain: TrustDomain,
    allowed_roles: Vec<WorkloadRole>,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |mut req: Request<()>| {
        let identity = peer_identity(req.extensions(), &trust_domain, &allowed_roles)?;
        req.extensions_mut().insert(identity);
        Ok(req)
    }
}

/// Interceptor variant for the connector's inbound server: tunneler peers
/// must additionally appear in the local allowlist.
pub fn require_identity_with_allowlist(
    trust_domain: TrustDomain,
    allowed_roles: Vec<WorkloadRole>,
    allowlist: Arc<dyn Allowlist>,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |mut req: Request<()>| {
        let identity = peer_identity(req.extensions(), &trust_domain, &allowed_roles)?;
        if identity.role() == WorkloadRole::Tunneler && !allowlist.allowed(&identity.spiffe_id) {
            tracing::warn!(spiffe = %identity.spiffe_id, "tunneler not allowlisted");
            return Err(Status::permission_denied("tunneler not allowed"));
        }
        req.extensions_mut().insert(identity);
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::CertificateDer;
    use tether_identity::ca::{generate_self_signed_ca, Ca};
    use time::Duration;

    fn ca() -> Ca {
        let (cert, key) =
            generate_self_signed_ca("interceptor test ca", Duration::days(1)).unwrap();
        Ca::load(&cert, &key).unwrap()
    }

    fn extensions_with_peer(der: Option<Vec<u8>>) -> tonic::Extensions {
        let mut ext = tonic::Extensions::default();
        ext.insert(TlsConnectInfo {
            remote_addr: None,
            peer_leaf: der.map(|d| CertificateDer::from(d).into_owned()),
        });
        ext
    }

    fn leaf(ca: &Ca, td: &str, role: WorkloadRole, id: &str) -> Vec<u8> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let spiffe = SpiffeId::new(TrustDomain::new(td).unwrap(), role, id).unwrap();
        let pem = ca
            .issue_workload_cert(&spiffe, &key.public_key_pem(), Duration::minutes(5), &[], &[])
            .unwrap();
        tether_identity::cert::parse_leaf(pem.as_bytes()).unwrap().der
    }

    #[test]
    fn accepts_allowed_role_and_publishes_identity() {
        let ca = ca();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let ext = extensions_with_peer(Some(leaf(&ca, "mycorp.internal", WorkloadRole::Connector, "c1")));

        let id = peer_identity(&ext, &td, &[WorkloadRole::Connector]).unwrap();
        assert_eq!(id.spiffe_id.to_string(), "spiffe://mycorp.internal/connector/c1");
        assert!(!id.serial.is_empty());
    }

    #[test]
    fn missing_tls_info_is_unauthenticated() {
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let err = peer_identity(&tonic::Extensions::default(), &td, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn missing_client_cert_is_unauthenticated() {
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let err = peer_identity(&extensions_with_peer(None), &td, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn trust_domain_mismatch_is_denied() {
        let ca = ca();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let ext = extensions_with_peer(Some(leaf(&ca, "other.internal", WorkloadRole::Connector, "c1")));
        let err = peer_identity(&ext, &td, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn unknown_role_is_denied_before_any_handler() {
        // A leaf whose URI SAN carries a role outside the known set.
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.subject_alt_names.push(rcgen::SanType::URI(
            rcgen::string::Ia5String::try_from(
                "spiffe://mycorp.internal/gateway/g1".to_string(),
            )
            .unwrap(),
        ));
        let cert = params.self_signed(&key).unwrap();

        let td = TrustDomain::new("mycorp.internal").unwrap();
        let ext = extensions_with_peer(Some(cert.der().to_vec()));
        let err = peer_identity(&ext, &td, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn disallowed_role_is_denied() {
        let ca = ca();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let ext = extensions_with_peer(Some(leaf(&ca, "mycorp.internal", WorkloadRole::Tunneler, "t1")));
        let err = peer_identity(&ext, &td, &[WorkloadRole::Connector]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    struct FixedAllowlist(Vec<String>);

    impl Allowlist for FixedAllowlist {
        fn allowed(&self, spiffe_id: &SpiffeId) -> bool {
            self.0.iter().any(|s| s == &spiffe_id.to_string())
        }
    }

    #[test]
    fn allowlist_gates_tunnelers() {
        let ca = ca();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let der = leaf(&ca, "mycorp.internal", WorkloadRole::Tunneler, "t1");

        let empty: Arc<dyn Allowlist> = Arc::new(FixedAllowlist(vec![]));
        let mut deny = require_identity_with_allowlist(
            td.clone(),
            vec![WorkloadRole::Tunneler],
            empty,
        );
        let mut req = Request::new(());
        req.extensions_mut().insert(TlsConnectInfo {
            remote_addr: None,
            peer_leaf: Some(CertificateDer::from(der.clone()).into_owned()),
        });
        assert_eq!(
            deny(req).unwrap_err().code(),
            tonic::Code::PermissionDenied
        );

        let listed: Arc<dyn Allowlist> = Arc::new(FixedAllowlist(vec![
            "spiffe://mycorp.internal/tunneler/t1".to_string(),
        ]));
        let mut allow = require_identity_with_allowlist(td, vec![WorkloadRole::Tunneler], listed);
        let mut req = Request::new(());
        req.extensions_mut().insert(TlsConnectInfo {
            remote_addr: None,
            peer_leaf: Some(CertificateDer::from(der).into_owned()),
        });
        let req = allow(req).unwrap();
        assert!(req.extensions().get::<PeerIdentity>().is_some());
    }
}
