//! Typed tunneler configuration, loaded once at startup.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tether-tunneler", version, about = "Tether tunneler")]
pub struct Config {
    /// Controller gRPC address, used for enrollment and renewal.
    #[arg(long, env = "CONTROLLER_ADDR")]
    pub controller_addr: String,

    /// Connector address this tunneler attaches to.
    #[arg(long, env = "CONNECTOR_ADDR")]
    pub connector_addr: String,

    /// Stable tunneler id.
    #[arg(long, env = "TUNNELER_ID")]
    pub tunneler_id: String,

    /// SPIFFE trust domain.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "mycorp.internal")]
    pub trust_domain: String,

    /// Pinned controller CA as inline PEM.
    #[arg(long, env = "CONTROLLER_CA", hide_env_values = true)]
    pub controller_ca: Option<String>,

    /// Path to the pinned controller CA PEM.
    #[arg(long, env = "CONTROLLER_CA_FILE")]
    pub controller_ca_file: Option<PathBuf>,

    /// One-time enrollment token. Falls back to the systemd credential
    /// `ENROLLMENT_TOKEN` when unset.
    #[arg(long, env = "ENROLLMENT_TOKEN", hide_env_values = true)]
    pub enrollment_token: Option<String>,
}

impl Config {
    pub fn controller_ca_pem(&self) -> anyhow::Result<String> {
        match (&self.controller_ca, &self.controller_ca_file) {
            (Some(pem), _) => Ok(pem.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading controller CA from {}", path.display())),
            (None, None) => anyhow::bail!("CONTROLLER_CA or CONTROLLER_CA_FILE is required"),
        }
    }

    pub fn resolve_token(&self) -> anyhow::Result<String> {
        self.enrollment_token
            .clone()
            .or_else(|| tether_agent::read_credential("ENROLLMENT_TOKEN"))
            .context("ENROLLMENT_TOKEN is required for enrollment")
    }
}
