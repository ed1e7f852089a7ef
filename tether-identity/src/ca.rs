//! Internal certificate authority.
//!
//! The controller owns a single self-signed P-256 CA and mints short-lived
//! workload leaves from it. The CA key is held in memory as PEM and never
//! leaves the controller process; workloads only ever see the CA
//! certificate.

use std::net::IpAddr;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    SubjectPublicKeyInfo,
};
use time::{Duration, OffsetDateTime};

use crate::cert;
use crate::spiffe::SpiffeId;

/// Clock-skew allowance applied to every issued certificate.
const NOT_BEFORE_SKEW: Duration = Duration::minutes(1);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaError {
    #[error("invalid certificate TTL")]
    InvalidTtl,

    #[error("CA certificate PEM is empty")]
    EmptyCert,

    #[error("CA private key PEM is empty")]
    EmptyKey,

    #[error("invalid CA certificate: {0}")]
    BadCert(String),

    #[error("invalid CA private key: {0}")]
    BadKey(String),

    #[error("invalid public key: {0}")]
    BadPublicKey(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),
}

/// Generates a standards-compliant self-signed CA certificate and key.
///
/// The certificate carries critical basic constraints with `MaxPathLen = 0`
/// and a cert-signing key usage over a fresh P-256 key pair. Returns
/// `(cert_pem, key_pem)`.
pub fn generate_self_signed_ca(
    common_name: &str,
    ttl: Duration,
) -> Result<(String, String), CaError> {
    if ttl <= Duration::ZERO {
        return Err(CaError::InvalidTtl);
    }

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + ttl;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CaError::Generation(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// The loaded internal CA.
///
/// Certificate and key are kept as PEM; the signing key pair is
/// re-deserialized per issuance since rcgen key pairs are not cloneable.
pub struct Ca {
    cert_pem: String,
    key_pem: String,
    cert_der: Vec<u8>,
}

impl Ca {
    /// Loads and validates a CA from PEM-encoded certificate and key.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        if cert_pem.trim().is_empty() {
            return Err(CaError::EmptyCert);
        }
        if key_pem.trim().is_empty() {
            return Err(CaError::EmptyKey);
        }

        // The key must parse and support signing.
        let _ = KeyPair::from_pem(key_pem).map_err(|e| CaError::BadKey(e.to_string()))?;

        cert::validate_ca_pem(cert_pem.as_bytes()).map_err(|e| CaError::BadCert(e.to_string()))?;
        let cert_der = cert::pem_to_der(cert_pem.as_bytes())
            .map_err(|e| CaError::BadCert(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
        })
    }

    /// The CA certificate in PEM form, as distributed to workloads.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The CA certificate in DER form, for pinned comparisons.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issues a short-lived workload leaf bound to `spiffe_id`.
    ///
    /// The leaf carries exactly one URI SAN (the SPIFFE identity), digital
    /// signature key usage, client+server auth extended usages, a 62-bit
    /// random serial, and a one-minute `NotBefore` backdate. The subject DN
    /// is left empty; identity is carried solely by the SAN.
    ///
    /// This function performs only structural checks. Authorization is the
    /// caller's responsibility.
    pub fn issue_workload_cert(
        &self,
        spiffe_id: &SpiffeId,
        public_key_pem: &str,
        ttl: Duration,
        dns_names: &[String],
        ip_addrs: &[IpAddr],
    ) -> Result<String, CaError> {
        if ttl <= Duration::ZERO {
            return Err(CaError::InvalidTtl);
        }

        let spki = SubjectPublicKeyInfo::from_pem(public_key_pem)
            .map_err(|e| CaError::BadPublicKey(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + ttl;

        let uri = Ia5String::try_from(spiffe_id.to_string())
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.subject_alt_names.push(SanType::URI(uri));
        for dns in dns_names {
            let name = Ia5String::try_from(dns.clone())
                .map_err(|e| CaError::Generation(e.to_string()))?;
            params.subject_alt_names.push(SanType::DnsName(name));
        }
        for ip in ip_addrs {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        let ca_key = KeyPair::from_pem(&self.key_pem).map_err(|e| CaError::BadKey(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| CaError::BadCert(e.to_string()))?;

        let cert = params
            .signed_by(&spki, &issuer)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        Ok(cert.pem())
    }
}

/// Serial drawn uniformly from a 62-bit space.
fn random_serial() -> SerialNumber {
    SerialNumber::from(rand::random::<u64>() >> 2)
}

/// Checks that `pem` holds a parseable PKIX public key.
///
/// Used by enrollment handlers to fail with an argument error before any
/// token is consumed.
pub fn validate_public_key_pem(pem: &str) -> Result<(), CaError> {
    if pem.trim().is_empty() {
        return Err(CaError::BadPublicKey("public key is empty".to_string()));
    }
    SubjectPublicKeyInfo::from_pem(pem)
        .map(|_| ())
        .map_err(|e| CaError::BadPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spiffe::{TrustDomain, WorkloadRole};

    fn test_ca() -> Ca {
        let (cert_pem, key_pem) =
            generate_self_signed_ca("tether test ca", Duration::days(365)).unwrap();
        Ca::load(&cert_pem, &key_pem).unwrap()
    }

    fn workload_key_pem() -> String {
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .public_key_pem()
    }

    fn connector_id(id: &str) -> SpiffeId {
        let td = TrustDomain::new("mycorp.internal").unwrap();
        SpiffeId::new(td, WorkloadRole::Connector, id).unwrap()
    }

    #[test]
    fn generated_ca_is_a_signing_ca() {
        let (cert_pem, key_pem) =
            generate_self_signed_ca("tether test ca", Duration::days(365)).unwrap();
        assert!(cert::validate_ca_pem(cert_pem.as_bytes()).is_ok());
        assert!(Ca::load(&cert_pem, &key_pem).is_ok());
    }

    #[test]
    fn generate_rejects_zero_ttl() {
        assert!(matches!(
            generate_self_signed_ca("x", Duration::ZERO),
            Err(CaError::InvalidTtl)
        ));
    }

    #[test]
    fn load_rejects_empty_inputs() {
        assert!(matches!(Ca::load("", "key"), Err(CaError::EmptyCert)));
        assert!(matches!(Ca::load("cert", ""), Err(CaError::EmptyKey)));
    }

    #[test]
    fn load_rejects_non_ca_certificate() {
        let ca = test_ca();
        let leaf = ca
            .issue_workload_cert(
                &connector_id("c1"),
                &workload_key_pem(),
                Duration::minutes(5),
                &[],
                &[],
            )
            .unwrap();
        let (_, key_pem) = generate_self_signed_ca("x", Duration::days(1)).unwrap();
        assert!(matches!(Ca::load(&leaf, &key_pem), Err(CaError::BadCert(_))));
    }

    #[test]
    fn issued_leaf_matches_template() {
        let ca = test_ca();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let pem = ca
            .issue_workload_cert(
                &connector_id("c1"),
                &workload_key_pem(),
                Duration::minutes(5),
                &[],
                &[ip],
            )
            .unwrap();

        let leaf = cert::parse_leaf(pem.as_bytes()).unwrap();
        assert!(!leaf.is_ca);
        assert_eq!(leaf.uri_sans, vec!["spiffe://mycorp.internal/connector/c1"]);
        assert_eq!(leaf.ip_sans, vec![ip]);

        let now = OffsetDateTime::now_utc();
        assert!(leaf.not_before < now);
        assert!(leaf.not_after > now + Duration::minutes(4));
        assert!(leaf.not_after < now + Duration::minutes(6));
    }

    #[test]
    fn controller_leaf_carries_dns_and_ip_sans() {
        let ca = test_ca();
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let id = SpiffeId::new(td, WorkloadRole::Controller, "controller").unwrap();
        let pem = ca
            .issue_workload_cert(
                &id,
                &workload_key_pem(),
                Duration::hours(12),
                &["localhost".to_string()],
                &["127.0.0.1".parse().unwrap()],
            )
            .unwrap();

        let leaf = cert::parse_leaf(pem.as_bytes()).unwrap();
        assert_eq!(leaf.dns_sans, vec!["localhost"]);
        assert_eq!(leaf.ip_sans, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(leaf.uri_sans.len(), 1);
    }

    #[test]
    fn issue_rejects_bad_inputs() {
        let ca = test_ca();
        let id = connector_id("c1");
        assert!(matches!(
            ca.issue_workload_cert(&id, &workload_key_pem(), Duration::ZERO, &[], &[]),
            Err(CaError::InvalidTtl)
        ));
        assert!(matches!(
            ca.issue_workload_cert(&id, "not a key", Duration::minutes(5), &[], &[]),
            Err(CaError::BadPublicKey(_))
        ));
    }

    #[test]
    fn serials_are_bounded_and_distinct() {
        let ca = test_ca();
        let key = workload_key_pem();
        let a = ca
            .issue_workload_cert(&connector_id("c1"), &key, Duration::minutes(5), &[], &[])
            .unwrap();
        let b = ca
            .issue_workload_cert(&connector_id("c1"), &key, Duration::minutes(5), &[], &[])
            .unwrap();
        let a = cert::parse_leaf(a.as_bytes()).unwrap();
        let b = cert::parse_leaf(b.as_bytes()).unwrap();
        assert_ne!(a.serial, b.serial);
    }
}
