//! Typed connector configuration, loaded once at startup.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tether-connector", version, about = "Tether connector")]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Controller gRPC address (`host:port`).
    #[arg(long, env = "CONTROLLER_ADDR")]
    pub controller_addr: String,

    /// Stable connector id.
    #[arg(long, env = "CONNECTOR_ID")]
    pub connector_id: String,

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

    /// Inbound listener for tunnelers; defaults to `<private_ip>:9443`.
    #[arg(long, env = "CONNECTOR_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Private IP override; derived from the route to the controller when
    /// unset.
    #[arg(long, env = "PRIVATE_IP")]
    pub private_ip: Option<IpAddr>,

    /// Enable systemd readiness and watchdog notifications.
    #[arg(long)]
    pub systemd_watchdog: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Enroll with the controller, verify the issued identity, and exit.
    Enroll,
    /// Enroll and run the connector (default).
    Run,
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

    pub fn resolve_private_ip(&self) -> anyhow::Result<IpAddr> {
        if let Some(ip) = self.private_ip {
            return Ok(ip);
        }
        private_ip_toward(&self.controller_addr)
    }
}

/// Derives the local address used to reach `addr` (no packets are sent).
pub fn private_ip_toward(addr: &str) -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding probe socket")?;
    socket
        .connect(addr)
        .with_context(|| format!("resolving route toward {addr}"))?;
    Ok(socket.local_addr().context("reading probe local address")?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_probe_yields_a_local_ip() {
        // Connecting a UDP socket never sends traffic; any reachable
        // address works for the probe.
        let ip = private_ip_toward("127.0.0.1:8443").unwrap();
        assert!(ip.is_loopback());
    }
}
