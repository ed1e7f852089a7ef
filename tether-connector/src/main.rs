//! Tether connector.
//!
//! Enrolls with the controller using a one-time token, keeps a persistent
//! control stream with heartbeats, serves attached tunnelers over mTLS
//! gated by the replicated allowlist, and renews its certificate ahead of
//! expiry.

mod allowlist;
mod config;
mod control;
mod server;
#[cfg(unix)]
mod watchdog;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_agent::{enroll_connector, renewal_loop, EnrollmentConfig, RenewalTask};
use tether_identity::spiffe::TrustDomain;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use allowlist::TunnelerAllowlist;
use config::Config;
use control::{control_loop, ControlTask};
use server::server_loop;

/// Depth of the tunneler-heartbeat relay buffer; overflow drops.
const RELAY_BUFFER: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    match config.command {
        Some(config::Command::Enroll) => enroll_once(config).await,
        Some(config::Command::Run) | None => run(config).await,
    }
}

/// One-shot enrollment: trade the token for an identity, print it, exit.
async fn enroll_once(config: Config) -> anyhow::Result<()> {
    let trust_domain =
        TrustDomain::new(&config.trust_domain).context("invalid trust domain")?;
    let controller_ca_pem = config.controller_ca_pem()?;
    let token = config.resolve_token()?;
    let private_ip = config.resolve_private_ip()?;

    let enrolled = enroll_connector(&EnrollmentConfig {
        controller_addr: config.controller_addr,
        trust_domain,
        id: config.connector_id,
        token,
        controller_ca_pem,
        private_ip: Some(private_ip.to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .await
    .context("connector enrollment failed")?;

    println!("Enrolled connector with SPIFFE ID: {}", enrolled.spiffe_id);
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let trust_domain =
        TrustDomain::new(&config.trust_domain).context("invalid trust domain")?;
    let controller_ca_pem = config.controller_ca_pem()?;
    let token = config.resolve_token()?;
    let private_ip = config.resolve_private_ip()?;
    let listen_addr: SocketAddr = config
        .listen_addr
        .unwrap_or_else(|| SocketAddr::new(private_ip, 9443));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    #[cfg(unix)]
    if config.systemd_watchdog {
        tokio::spawn(watchdog::watchdog_loop(cancel.clone()));
    }

    // ---- bootstrap enrollment ----
    let enrolled = enroll_connector(&EnrollmentConfig {
        controller_addr: config.controller_addr.clone(),
        trust_domain: trust_domain.clone(),
        id: config.connector_id.clone(),
        token,
        controller_ca_pem,
        private_ip: Some(private_ip.to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .await
    .context("connector enrollment failed")?;
    tracing::info!(spiffe = %enrolled.spiffe_id, "connector enrolled");

    let allowlist = Arc::new(TunnelerAllowlist::new());
    let (relay_tx, relay_rx) = mpsc::channel(RELAY_BUFFER);
    let (reload_tx, reload_rx) = watch::channel(());

    // ---- control stream to the controller ----
    tokio::spawn(control_loop(
        ControlTask {
            controller_addr: config.controller_addr.clone(),
            trust_domain: trust_domain.clone(),
            connector_id: config.connector_id.clone(),
            private_ip: private_ip.to_string(),
            store: enrolled.store.clone(),
            ca_pem: enrolled.ca_pem.clone(),
            allowlist: allowlist.clone(),
            relay: relay_rx,
            reload: reload_rx,
        },
        cancel.clone(),
    ));

    // ---- certificate renewal ----
    tokio::spawn(renewal_loop(
        RenewalTask {
            controller_addr: config.controller_addr.clone(),
            trust_domain: trust_domain.clone(),
            workload_id: config.connector_id.clone(),
            store: enrolled.store.clone(),
            ca_pem: enrolled.ca_pem.clone(),
            reload: reload_tx,
        },
        cancel.clone(),
    ));

    // ---- inbound server for tunnelers ----
    tokio::spawn(server_loop(
        listen_addr,
        trust_domain,
        enrolled.store,
        enrolled.ca_pem,
        allowlist,
        relay_tx,
        config.connector_id,
        cancel.clone(),
    ));

    cancel.cancelled().await;
    tracing::info!("connector shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}
