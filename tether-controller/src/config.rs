//! Typed controller configuration, loaded once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::state::TokenPolicy;

#[derive(Parser, Debug)]
#[command(name = "tether-controller", version, about = "Tether controller")]
pub struct Config {
    /// SPIFFE trust domain for every issued identity.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "mycorp.internal")]
    pub trust_domain: String,

    /// gRPC listener for enrollment and the control plane.
    #[arg(long, env = "CONTROLLER_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: SocketAddr,

    /// Admin HTTP listener.
    #[arg(long, env = "ADMIN_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub admin_listen_addr: SocketAddr,

    /// Internal CA certificate as inline PEM.
    #[arg(long, env = "INTERNAL_CA_CERT", hide_env_values = true)]
    pub ca_cert: Option<String>,

    /// Internal CA private key as inline PEM.
    #[arg(long, env = "INTERNAL_CA_KEY", hide_env_values = true)]
    pub ca_key: Option<String>,

    /// Path to the internal CA certificate PEM.
    #[arg(long, env = "INTERNAL_CA_CERT_FILE")]
    pub ca_cert_file: Option<PathBuf>,

    /// Path to the internal CA private key PEM.
    #[arg(long, env = "INTERNAL_CA_KEY_FILE")]
    pub ca_key_file: Option<PathBuf>,

    /// Bearer token protecting the admin endpoints.
    #[arg(long, env = "ADMIN_AUTH_TOKEN", hide_env_values = true)]
    pub admin_auth_token: Option<String>,

    /// Shared secret for the internal consume-token endpoint.
    #[arg(long, env = "INTERNAL_AUTH_TOKEN", hide_env_values = true)]
    pub internal_auth_token: Option<String>,

    /// Bootstrap token lifetime in seconds.
    #[arg(long, env = "TOKEN_TTL_SECONDS", default_value_t = 600)]
    pub token_ttl_seconds: u64,

    /// When set, the token set is persisted here across restarts.
    #[arg(long, env = "TOKEN_STORE_PATH")]
    pub token_store_path: Option<PathBuf>,

    /// Token consumption policy.
    #[arg(long, env = "TOKEN_POLICY", value_enum, default_value_t = TokenPolicy::SingleUse)]
    pub token_policy: TokenPolicy,

    /// Connector workload certificate lifetime in seconds.
    #[arg(long, env = "CONNECTOR_CERT_TTL_SECONDS", default_value_t = 300)]
    pub connector_cert_ttl_seconds: u32,

    /// Tunneler workload certificate lifetime in seconds.
    #[arg(long, env = "TUNNELER_CERT_TTL_SECONDS", default_value_t = 1800)]
    pub tunneler_cert_ttl_seconds: u32,
}

impl Config {
    /// Resolves the CA material from inline PEM or files. `None` means no
    /// CA was configured and the controller generates an ephemeral one.
    pub fn ca_material(&self) -> anyhow::Result<Option<(String, String)>> {
        let cert = match (&self.ca_cert, &self.ca_cert_file) {
            (Some(pem), _) => Some(pem.clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading CA certificate from {}", path.display()))?,
            ),
            (None, None) => None,
        };
        let key = match (&self.ca_key, &self.ca_key_file) {
            (Some(pem), _) => Some(pem.clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading CA key from {}", path.display()))?,
            ),
            (None, None) => None,
        };

        match (cert, key) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            (None, None) => Ok(None),
            _ => anyhow::bail!("INTERNAL_CA_CERT and INTERNAL_CA_KEY must be set together"),
        }
    }
}
