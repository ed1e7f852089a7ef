//! SPIFFE trust domain and workload identity types.
//!
//! Every workload certificate carries exactly one URI SAN of the form
//! `spiffe://<trust-domain>/<role>/<id>`. The path always has exactly two
//! segments; anything else is rejected.

use std::fmt;
use std::str::FromStr;

const SCHEME_PREFIX: &str = "spiffe://";

const VALID_TRUST_DOMAIN_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";

/// Maximum length of a workload id.
const MAX_ID_LEN: usize = 128;

/// An error that can arise parsing a trust domain or SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SpiffeError {
    #[error("trust domain cannot be empty")]
    EmptyTrustDomain,

    #[error(
        "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and \
         underscores"
    )]
    BadTrustDomainChar,

    #[error("SPIFFE ID must use the spiffe:// scheme")]
    WrongScheme,

    #[error("SPIFFE path must have exactly two non-empty segments")]
    BadPath,

    #[error("unknown workload role {0:?}")]
    UnknownRole(String),

    #[error("workload id must match [A-Za-z0-9._-]{{1,128}}")]
    BadWorkloadId,

    #[error("SPIFFE trust domain mismatch: expected {expected}, got {actual}")]
    TrustDomainMismatch { expected: String, actual: String },
}

/// A SPIFFE trust domain: a bare DNS-like name without scheme or trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrustDomain {
    name: String,
}

impl TrustDomain {
    /// Parses a trust domain, normalizing surrounding whitespace and a
    /// trailing dot.
    pub fn new(name: &str) -> Result<Self, SpiffeError> {
        let name = name.trim().trim_end_matches('.');
        if name.is_empty() {
            return Err(SpiffeError::EmptyTrustDomain);
        }
        if name.chars().any(|c| !VALID_TRUST_DOMAIN_CHARS.contains(c)) {
            return Err(SpiffeError::BadTrustDomainChar);
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for TrustDomain {
    type Err = SpiffeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The role segment of a workload identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadRole {
    Controller,
    Connector,
    Tunneler,
}

impl WorkloadRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Connector => "connector",
            Self::Tunneler => "tunneler",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SpiffeError> {
        match s {
            "controller" => Ok(Self::Controller),
            "connector" => Ok(Self::Connector),
            "tunneler" => Ok(Self::Tunneler),
            other => Err(SpiffeError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for WorkloadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `id` is a valid workload id: `[A-Za-z0-9._-]{1,128}`.
pub fn valid_workload_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// A fully qualified workload identity: `spiffe://<trust-domain>/<role>/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    role: WorkloadRole,
    id: String,
}

impl SpiffeId {
    /// Builds an identity from parts, validating the workload id.
    pub fn new(
        trust_domain: TrustDomain,
        role: WorkloadRole,
        id: &str,
    ) -> Result<Self, SpiffeError> {
        if !valid_workload_id(id) {
            return Err(SpiffeError::BadWorkloadId);
        }
        Ok(Self {
            trust_domain,
            role,
            id: id.to_string(),
        })
    }

    /// Parses a SPIFFE URI string.
    pub fn parse(uri: &str) -> Result<Self, SpiffeError> {
        let rest = uri.strip_prefix(SCHEME_PREFIX).ok_or(SpiffeError::WrongScheme)?;

        let (host, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => return Err(SpiffeError::BadPath),
        };
        let trust_domain = TrustDomain::new(host)?;

        let mut segments = path.split('/');
        let (role, id) = match (segments.next(), segments.next(), segments.next()) {
            (Some(role), Some(id), None) if !role.is_empty() && !id.is_empty() => (role, id),
            _ => return Err(SpiffeError::BadPath),
        };

        let role = WorkloadRole::parse(role)?;
        Self::new(trust_domain, role, id)
    }

    /// Parses a SPIFFE URI and additionally requires it to live in
    /// `trust_domain`.
    pub fn parse_in_domain(uri: &str, trust_domain: &TrustDomain) -> Result<Self, SpiffeError> {
        let id = Self::parse(uri)?;
        if id.trust_domain() != trust_domain {
            return Err(SpiffeError::TrustDomainMismatch {
                expected: trust_domain.to_string(),
                actual: id.trust_domain.to_string(),
            });
        }
        Ok(id)
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn role(&self) -> WorkloadRole {
        self.role
    }

    pub fn workload_id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            SCHEME_PREFIX, self.trust_domain, self.role, self.id
        )
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_domain_normalization() {
        let td = TrustDomain::new("  mycorp.internal.  ").unwrap();
        assert_eq!(td.as_str(), "mycorp.internal");
    }

    #[test]
    fn trust_domain_rejects_scheme_and_upper() {
        assert!(TrustDomain::new("").is_err());
        assert!(TrustDomain::new("spiffe://mycorp.internal").is_err());
        assert!(TrustDomain::new("MyCorp.internal").is_err());
    }

    #[test]
    fn spiffe_id_roundtrip() {
        let id = SpiffeId::parse("spiffe://mycorp.internal/connector/c1").unwrap();
        assert_eq!(id.trust_domain().as_str(), "mycorp.internal");
        assert_eq!(id.role(), WorkloadRole::Connector);
        assert_eq!(id.workload_id(), "c1");
        assert_eq!(id.to_string(), "spiffe://mycorp.internal/connector/c1");
    }

    #[test]
    fn spiffe_id_requires_two_segments() {
        assert!(SpiffeId::parse("spiffe://mycorp.internal/connector").is_err());
        assert!(SpiffeId::parse("spiffe://mycorp.internal/connector/c1/extra").is_err());
        assert!(SpiffeId::parse("spiffe://mycorp.internal//c1").is_err());
        assert!(SpiffeId::parse("spiffe://mycorp.internal/connector/").is_err());
    }

    #[test]
    fn spiffe_id_requires_scheme() {
        assert!(matches!(
            SpiffeId::parse("https://mycorp.internal/connector/c1"),
            Err(SpiffeError::WrongScheme)
        ));
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(matches!(
            SpiffeId::parse("spiffe://mycorp.internal/gateway/g1"),
            Err(SpiffeError::UnknownRole(_))
        ));
    }

    #[test]
    fn workload_id_charset() {
        assert!(valid_workload_id("edge-1.zone_a"));
        assert!(!valid_workload_id(""));
        assert!(!valid_workload_id("bad/segment"));
        assert!(!valid_workload_id(&"x".repeat(129)));
        assert!(valid_workload_id(&"x".repeat(128)));
    }

    #[test]
    fn domain_mismatch_is_detected() {
        let td = TrustDomain::new("mycorp.internal").unwrap();
        let err =
            SpiffeId::parse_in_domain("spiffe://other.internal/connector/c1", &td).unwrap_err();
        assert!(matches!(err, SpiffeError::TrustDomainMismatch { .. }));
    }
}
