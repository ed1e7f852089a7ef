//! Certificate parsing helpers shared by every workload.

use std::net::IpAddr;

use ::time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CertParseError {
    #[error("invalid certificate PEM")]
    BadPem,

    #[error("failed to parse certificate: {0}")]
    BadDer(String),

    #[error("certificate is not a valid CA")]
    NotACa,

    #[error("CA certificate missing cert-sign key usage")]
    MissingCertSign,
}

/// Structural facts about a parsed leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub der: Vec<u8>,
    pub uri_sans: Vec<String>,
    pub dns_sans: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub is_ca: bool,
}

/// Decodes the first CERTIFICATE block of a PEM document into DER bytes.
pub fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>, CertParseError> {
    let (_, doc) = parse_x509_pem(pem).map_err(|_| CertParseError::BadPem)?;
    if doc.label != "CERTIFICATE" {
        return Err(CertParseError::BadPem);
    }
    Ok(doc.contents)
}

/// Parses a PEM-encoded certificate into [`LeafInfo`].
pub fn parse_leaf(pem: &[u8]) -> Result<LeafInfo, CertParseError> {
    let der = pem_to_der(pem)?;
    parse_leaf_der(&der)
}

/// Parses a DER-encoded certificate into [`LeafInfo`].
pub fn parse_leaf_der(der: &[u8]) -> Result<LeafInfo, CertParseError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CertParseError::BadDer(e.to_string()))?;

    let mut uri_sans = Vec::new();
    let mut dns_sans = Vec::new();
    let mut ip_sans = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::URI(uri) => uri_sans.push((*uri).to_string()),
                GeneralName::DNSName(dns) => dns_sans.push((*dns).to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        ip_sans.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

    Ok(LeafInfo {
        der: der.to_vec(),
        uri_sans,
        dns_sans,
        ip_sans,
        serial: cert.raw_serial_as_string(),
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
        is_ca,
    })
}

/// Ensures the PEM contains a CA certificate with cert-sign key usage.
pub fn validate_ca_pem(pem: &[u8]) -> Result<(), CertParseError> {
    let der = pem_to_der(pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| CertParseError::BadDer(e.to_string()))?;

    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);
    if !is_ca {
        return Err(CertParseError::NotACa);
    }

    match cert.key_usage() {
        Ok(Some(usage)) if usage.value.key_cert_sign() => Ok(()),
        _ => Err(CertParseError::MissingCertSign),
    }
}

/// Compares two CA PEM documents by their DER bytes.
pub fn ca_der_equal(a: &[u8], b: &[u8]) -> bool {
    match (pem_to_der(a), pem_to_der(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::generate_self_signed_ca;
    use ::time::Duration;

    #[test]
    fn pem_decode_rejects_garbage() {
        assert!(pem_to_der(b"not pem at all").is_err());
        assert!(parse_leaf(b"-----BEGIN JUNK-----\nabcd\n-----END JUNK-----\n").is_err());
    }

    #[test]
    fn ca_pem_validates() {
        let (cert_pem, _) = generate_self_signed_ca("test ca", Duration::days(1)).unwrap();
        assert!(validate_ca_pem(cert_pem.as_bytes()).is_ok());
    }

    #[test]
    fn ca_der_comparison() {
        let (a, _) = generate_self_signed_ca("a", Duration::days(1)).unwrap();
        let (b, _) = generate_self_signed_ca("b", Duration::days(1)).unwrap();
        assert!(ca_der_equal(a.as_bytes(), a.as_bytes()));
        assert!(!ca_der_equal(a.as_bytes(), b.as_bytes()));
        assert!(!ca_der_equal(a.as_bytes(), b"junk"));
    }
}
