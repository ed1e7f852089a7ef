//! Outbound control stream to the connector.
//!
//! Hello on connect, then a heartbeat every ten seconds carrying this
//! tunneler's identity. Inbound traffic is drained (pongs only); a renewal
//! reload tears the session down so the next handshake presents the new
//! certificate. Reconnects back off exponentially from two to thirty
//! seconds.

use std::sync::Arc;
use std::time::Duration;

use tether_agent::mtls_channel;
use tether_identity::spiffe::{SpiffeId, TrustDomain, WorkloadRole};
use tether_proto::control_plane_client::ControlPlaneClient;
use tether_proto::envelope::{ControlEvent, TunnelerHeartbeat};
use tether_proto::ControlMessage;
use tether_tls::CertStore;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct ControlTask {
    pub connector_addr: String,
    pub trust_domain: TrustDomain,
    pub spiffe_id: SpiffeId,
    pub store: Arc<CertStore>,
    pub ca_pem: String,
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
                tracing::info!("certificate reloaded, reconnecting to connector");
            }
            Err(e) => {
                tracing::warn!(error = %e, "connector connection ended");
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
        &task.connector_addr,
        &task.ca_pem,
        &task.trust_domain,
        WorkloadRole::Connector,
        task.store.clone(),
    )
    .await?;
    let mut client = ControlPlaneClient::new(channel);

    let (tx, rx) = mpsc::channel::<ControlMessage>(16);
    tx.send(ControlEvent::TunnelerHello.into_message()).await?;

    let mut inbound = client
        .connect(ReceiverStream::new(rx))
        .await?
        .into_inner();
    tracing::info!(addr = %task.connector_addr, "attached to connector");

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
                if msg?.is_none() {
                    anyhow::bail!("connector closed the stream");
                }
            }

            _ = ticker.tick() => {
                tx.send(heartbeat(&task.spiffe_id)).await?;
            }
        }
    }
}

/// Heartbeat payload: this tunneler's identity, marked online.
fn heartbeat(spiffe_id: &SpiffeId) -> ControlMessage {
    let mut msg = ControlEvent::TunnelerHeartbeat(TunnelerHeartbeat {
        tunneler_id: spiffe_id.workload_id().to_string(),
        spiffe_id: spiffe_id.to_string(),
        status: String::new(),
        connector_id: String::new(),
    })
    .into_message();
    msg.status = "ONLINE".to_string();
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::envelope::kind;

    #[test]
    fn heartbeat_carries_identity_and_status() {
        let spiffe = SpiffeId::parse("spiffe://mycorp.internal/tunneler/t1").unwrap();
        let msg = heartbeat(&spiffe);
        assert_eq!(msg.r#type, kind::TUNNELER_HEARTBEAT);
        assert_eq!(msg.status, "ONLINE");

        let ControlEvent::TunnelerHeartbeat(hb) = ControlEvent::decode(&msg).unwrap() else {
            panic!("expected tunneler_heartbeat");
        };
        assert_eq!(hb.tunneler_id, "t1");
        assert_eq!(hb.spiffe_id, "spiffe://mycorp.internal/tunneler/t1");
    }
}
