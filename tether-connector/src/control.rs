//! Outbound control stream to the controller.
//!
//! One session at a time: hello, then heartbeats every ten seconds, with
//! allowlist messages applied as they arrive and relayed tunneler
//! heartbeats forwarded upstream. A renewal reload signal tears the
//! session down so the next handshake presents the new certificate.
//! Reconnects back off exponentially from two to thirty seconds.

use std::sync::Arc;
use std::time::Duration;

use tether_agent::mtls_channel;
use tether_identity::spiffe::{TrustDomain, WorkloadRole};
use tether_proto::control_plane_client::ControlPlaneClient;
use tether_proto::envelope::ControlEvent;
use tether_proto::ControlMessage;
use tether_tls::CertStore;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::allowlist::TunnelerAllowlist;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct ControlTask {
    pub controller_addr: String,
    pub trust_domain: TrustDomain,
    pub connector_id: String,
    pub private_ip: String,
    pub store: Arc<CertStore>,
    pub ca_pem: String,
    pub allowlist: Arc<TunnelerAllowlist>,
    /// Tunneler heartbeats relayed from the inbound server.
    pub relay: mpsc::Receiver<ControlMessage>,
    /// Fires after a successful certificate renewal.
    pub reload: watch::Receiver<()>,
}

enum SessionEnd {
    Cancelled,
    Reload,
}

pub async fn control_loop(mut task: ControlTask, cancel: CancellationToken) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match run_session(&mut task, &cancel).await {
            Ok(SessionEnd::Cancelled) => return,
            Ok(SessionEnd::Reload) => {
                tracing::info!("certificate reloaded, reconnecting control stream");
            }
            Err(e) => {
                tracing::warn!(error = %e, "control-plane connection ended");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn run_session(
    task: &mut ControlTask,
    cancel: &CancellationToken,
) -> anyhow::Result<SessionEnd> {
    let channel = mtls_channel(
        &task.controller_addr,
        &task.ca_pem,
        &task.trust_domain,
        WorkloadRole::Controller,
        task.store.clone(),
    )
    .await?;
    let mut client = ControlPlaneClient::new(channel);

    let (tx, rx) = mpsc::channel::<ControlMessage>(16);
    tx.send(ControlEvent::ConnectorHello.into_message()).await?;

    let mut inbound = client
        .connect(ReceiverStream::new(rx))
        .await?
        .into_inner();
    tracing::info!(addr = %task.controller_addr, "control-plane stream connected");

    let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
    ticker.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),

            result = task.reload.changed() => {
                if result.is_ok() {
                    return Ok(SessionEnd::Reload);
                }
            }

            msg = inbound.message() => {
                match msg? {
                    Some(msg) => apply_control_message(&msg, &task.allowlist),
                    None => anyhow::bail!("controller closed the stream"),
                }
            }

            Some(relayed) = task.relay.recv() => {
                tx.send(relayed).await?;
            }

            _ = ticker.tick() => {
                tx.send(
                    ControlEvent::Heartbeat {
                        connector_id: task.connector_id.clone(),
                        private_ip: task.private_ip.clone(),
                        status: "ONLINE".to_string(),
                    }
                    .into_message(),
                )
                .await?;
            }
        }
    }
}

/// Applies an allowlist snapshot or delta from the controller.
pub fn apply_control_message(msg: &ControlMessage, allowlist: &TunnelerAllowlist) {
    match ControlEvent::decode(msg) {
        Ok(ControlEvent::TunnelerAllowlist(entries)) => {
            allowlist.replace(&entries);
            tracing::info!(count = entries.len(), "allowlist snapshot applied");
        }
        Ok(ControlEvent::TunnelerAllow(entry)) => {
            tracing::info!(spiffe = %entry.spiffe_id, "allowlist delta applied");
            allowlist.add(&entry.spiffe_id);
        }
        Ok(ControlEvent::Pong) => {}
        Ok(other) => {
            tracing::debug!(event = ?other, "ignoring control message");
        }
        Err(e) => {
            tracing::debug!(error = %e, "undecodable control message");
        }
    }
}
