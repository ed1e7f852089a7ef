//! Tether tunneler.
//!
//! Enrolls with the controller using a one-time token, attaches to a
//! connector over mTLS, heartbeats every ten seconds, and renews its
//! certificate ahead of expiry.

mod config;
mod control;

use anyhow::Context;
use clap::Parser;
use tether_agent::{enroll_tunneler, renewal_loop, EnrollmentConfig, RenewalTask};
use tether_identity::spiffe::TrustDomain;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::Config;
use control::{control_loop, ControlTask};

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
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let trust_domain =
        TrustDomain::new(&config.trust_domain).context("invalid trust domain")?;
    let controller_ca_pem = config.controller_ca_pem()?;
    let token = config.resolve_token()?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // ---- bootstrap enrollment ----
    let enrolled = enroll_tunneler(&EnrollmentConfig {
        controller_addr: config.controller_addr.clone(),
        trust_domain: trust_domain.clone(),
        id: config.tunneler_id.clone(),
        token,
        controller_ca_pem,
        private_ip: None,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .await
    .context("tunneler enrollment failed")?;
    tracing::info!(spiffe = %enrolled.spiffe_id, "tunneler enrolled");

    let (reload_tx, reload_rx) = watch::channel(());

    // ---- control stream to the connector ----
    tokio::spawn(control_loop(
        ControlTask {
            connector_addr: config.connector_addr.clone(),
            trust_domain: trust_domain.clone(),
            spiffe_id: enrolled.spiffe_id.clone(),
            store: enrolled.store.clone(),
            ca_pem: enrolled.ca_pem.clone(),
            reload: reload_rx,
        },
        cancel.clone(),
    ));

    // ---- certificate renewal ----
    tokio::spawn(renewal_loop(
        RenewalTask {
            controller_addr: config.controller_addr,
            trust_domain,
            workload_id: config.tunneler_id,
            store: enrolled.store,
            ca_pem: enrolled.ca_pem,
            reload: reload_tx,
        },
        cancel.clone(),
    ));

    cancel.cancelled().await;
    tracing::info!("tunneler shutdown complete");
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
