//! Tether controller.
//!
//! Owns the internal CA, serves enrollment and the control plane over a
//! single TLS 1.3 listener, tracks connector and tunneler presence, and
//! exposes the admin HTTP API.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use clap::Parser;
use rcgen::KeyPair;
use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};
use tether_identity::{generate_self_signed_ca, Ca};
use tether_proto::control_plane_server::ControlPlaneServer;
use tether_proto::enrollment_service_server::EnrollmentServiceServer;
use tether_tls::{
    require_identity, root_store_from_pem, server_config_optional_mtls, tls_incoming, ActiveCert,
    CertStore,
};
use time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use tether_controller::config::Config;
use tether_controller::grpc::{ControlPlaneApi, EnrollmentApi};
use tether_controller::hub::Hub;
use tether_controller::state::{
    ConnectorRegistry, TokenStore, TunnelerDirectory, TunnelerPresence,
};
use tether_controller::admin;

/// Lifetime of the controller's own server certificate.
const SERVER_CERT_TTL: Duration = Duration::hours(12);

/// Lifetime of a generated development CA.
const GENERATED_CA_TTL: Duration = Duration::days(3650);

/// Transport keepalive, mirroring the client side.
const KEEPALIVE_INTERVAL: StdDuration = StdDuration::from_secs(30);
const KEEPALIVE_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Expired bootstrap tokens are swept on this period.
const TOKEN_PURGE_PERIOD: StdDuration = StdDuration::from_secs(60);

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

    // ---- internal CA ----
    let ca = match config.ca_material()? {
        Some((cert_pem, key_pem)) => {
            Ca::load(&cert_pem, &key_pem).context("failed to load internal CA")?
        }
        None => {
            tracing::warn!(
                "no internal CA configured; generating an ephemeral CA (development mode)"
            );
            let common_name = format!("tether internal ca ({trust_domain})");
            let (cert_pem, key_pem) = generate_self_signed_ca(&common_name, GENERATED_CA_TTL)
                .context("failed to generate internal CA")?;
            Ca::load(&cert_pem, &key_pem).context("failed to load generated CA")?
        }
    };
    let ca = Arc::new(ca);

    // ---- controller server identity ----
    let server_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .context("failed to generate controller key")?;
    let server_id = SpiffeId::new(
        trust_domain.clone(),
        WorkloadRole::Controller,
        "controller",
    )
    .expect("static controller id is valid");
    let server_cert_pem = ca
        .issue_workload_cert(
            &server_id,
            &server_key.public_key_pem(),
            SERVER_CERT_TTL,
            &["localhost".to_string()],
            &["127.0.0.1".parse().unwrap()],
        )
        .context("failed to issue controller certificate")?;
    let store = CertStore::new(
        ActiveCert::from_pem_and_key(&server_cert_pem, server_key.serialize_der())
            .context("failed to build controller certificate store")?,
    );
    tracing::info!(spiffe = %server_id, not_after = %store.not_after(), "controller identity ready");

    // ---- state ----
    let tokens = Arc::new(
        TokenStore::open(
            StdDuration::from_secs(config.token_ttl_seconds),
            config.token_policy,
            config.token_store_path.clone(),
        )
        .context("failed to open token store")?,
    );
    let connectors = Arc::new(ConnectorRegistry::new());
    let presence = Arc::new(TunnelerPresence::new());
    let directory = Arc::new(TunnelerDirectory::new());
    let hub = Hub::new();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // ---- periodic token sweep ----
    {
        let tokens = tokens.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TOKEN_PURGE_PERIOD);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let purged = tokens.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "expired tokens purged");
                        }
                    }
                }
            }
        });
    }

    // ---- gRPC services ----
    let enrollment = EnrollmentApi::new(
        ca.clone(),
        trust_domain.clone(),
        Some(tokens.clone()),
        connectors.clone(),
        directory.clone(),
        hub.clone(),
        Duration::seconds(i64::from(config.connector_cert_ttl_seconds)),
        Duration::seconds(i64::from(config.tunneler_cert_ttl_seconds)),
    );
    let control_plane = ControlPlaneApi {
        connectors: connectors.clone(),
        presence: presence.clone(),
        directory: directory.clone(),
        hub: hub.clone(),
    };

    // ---- TLS listener ----
    let roots = root_store_from_pem(ca.cert_pem().as_bytes())
        .context("failed to build root store from internal CA")?;
    let tls_config = server_config_optional_mtls(roots, store.clone())
        .context("failed to build server TLS config")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "controller gRPC listening");

    let incoming = tls_incoming(listener, acceptor, cancel.clone());

    let grpc = Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .add_service(EnrollmentServiceServer::new(enrollment))
        .add_service(ControlPlaneServer::with_interceptor(
            control_plane,
            require_identity(trust_domain.clone(), vec![WorkloadRole::Connector]),
        ))
        .serve_with_incoming_shutdown(incoming, cancel.clone().cancelled_owned());

    // ---- admin HTTP ----
    let admin_state = admin::AdminState {
        tokens,
        connectors,
        tunnelers: presence,
        admin_auth_token: config.admin_auth_token.clone(),
        internal_auth_token: config.internal_auth_token.clone(),
    };
    let admin_listener = TcpListener::bind(config.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.admin_listen_addr))?;
    tracing::info!(addr = %config.admin_listen_addr, "admin HTTP listening");
    let admin = axum::serve(admin_listener, admin::router(admin_state))
        .with_graceful_shutdown(cancel.clone().cancelled_owned());

    let (grpc_result, admin_result) = tokio::join!(grpc, async move { admin.await });
    grpc_result.context("gRPC server failed")?;
    admin_result.context("admin server failed")?;

    tracing::info!("controller shutdown complete");
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
