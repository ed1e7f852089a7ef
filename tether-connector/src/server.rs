//! Inbound mTLS server for tunnelers.
//!
//! Requires and verifies client certificates against the internal CA; the
//! interceptor additionally rejects tunnelers missing from the local
//! allowlist. Tunneler heartbeats are re-wrapped with this connector's id
//! and offered to the relay channel; overflow drops rather than
//! back-pressuring the tunneler's stream.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tether_identity::spiffe::{TrustDomain, WorkloadRole};
use tether_proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use tether_proto::envelope::{ControlEvent, TunnelerHeartbeat};
use tether_proto::ControlMessage;
use tether_tls::{
    require_identity_with_allowlist, root_store_from_pem, server_config_require_mtls,
    tls_incoming, CertStore, PeerIdentity,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::allowlist::TunnelerAllowlist;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Control-plane service exposed to attached tunnelers.
pub struct InboundControlPlane {
    connector_id: String,
    relay: mpsc::Sender<ControlMessage>,
}

impl InboundControlPlane {
    pub fn new(connector_id: String, relay: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            connector_id,
            relay,
        }
    }
}

type ConnectStream = Pin<Box<dyn Stream<Item = Result<ControlMessage, Status>> + Send>>;

#[tonic::async_trait]
impl ControlPlane for InboundControlPlane {
    type ConnectStream = ConnectStream;

    async fn connect(
        &self,
        request: Request<Streaming<ControlMessage>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let peer = request
            .extensions()
            .get::<PeerIdentity>()
            .cloned()
            .ok_or_else(|| Status::unauthenticated("missing SPIFFE identity"))?;
        if peer.role() != WorkloadRole::Tunneler {
            return Err(Status::permission_denied("tunneler role required"));
        }

        tracing::info!(spiffe = %peer.spiffe_id, "tunneler connected");

        let inbound = request.into_inner();
        let (reply, mailbox) = mpsc::channel::<ControlMessage>(8);
        let relay = self.relay.clone();
        let connector_id = self.connector_id.clone();

        tokio::spawn(async move {
            relay_inbound(inbound, reply, relay, &peer, &connector_id).await;
            tracing::info!(spiffe = %peer.spiffe_id, "tunneler disconnected");
        });

        let outbound = ReceiverStream::new(mailbox).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}

/// Drains one tunneler's stream, answering pings and relaying heartbeats
/// upstream under the peer's verified identity.
async fn relay_inbound<S>(
    mut inbound: S,
    reply: mpsc::Sender<ControlMessage>,
    relay: mpsc::Sender<ControlMessage>,
    peer: &PeerIdentity,
    connector_id: &str,
) where
    S: Stream<Item = Result<ControlMessage, Status>> + Unpin,
{
    loop {
        let msg = match inbound.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "tunneler stream receive error");
                return;
            }
            None => return,
        };

        match ControlEvent::decode(&msg) {
            Ok(ControlEvent::Ping) => {
                let _ = reply.try_send(ControlEvent::Pong.into_message());
            }
            Ok(ControlEvent::TunnelerHeartbeat(_)) => {
                // Identity comes from the verified peer certificate, never
                // from the payload.
                let upstream = ControlEvent::TunnelerHeartbeat(TunnelerHeartbeat {
                    tunneler_id: peer.spiffe_id.workload_id().to_string(),
                    spiffe_id: peer.spiffe_id.to_string(),
                    status: msg.status.clone(),
                    connector_id: connector_id.to_string(),
                })
                .into_message();
                if relay.try_send(upstream).is_err() {
                    tracing::debug!("relay buffer full, dropping tunneler heartbeat");
                }
            }
            Ok(ControlEvent::TunnelerHello) => {}
            Ok(other) => {
                tracing::debug!(event = ?other, "ignoring tunneler message");
            }
            Err(e) => {
                tracing::debug!(error = %e, "undecodable tunneler message");
            }
        }
    }
}

/// Runs the inbound server, restarting with backoff on failure.
#[allow(clippy::too_many_arguments)]
pub async fn server_loop(
    listen_addr: SocketAddr,
    trust_domain: TrustDomain,
    store: Arc<CertStore>,
    ca_pem: String,
    allowlist: Arc<TunnelerAllowlist>,
    relay: mpsc::Sender<ControlMessage>,
    connector_id: String,
    cancel: CancellationToken,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = run_server(
            listen_addr,
            &trust_domain,
            store.clone(),
            &ca_pem,
            allowlist.clone(),
            relay.clone(),
            connector_id.clone(),
            cancel.clone(),
        )
        .await
        {
            tracing::warn!(error = %e, "connector server stopped");
        }
        if cancel.is_cancelled() {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    listen_addr: SocketAddr,
    trust_domain: &TrustDomain,
    store: Arc<CertStore>,
    ca_pem: &str,
    allowlist: Arc<TunnelerAllowlist>,
    relay: mpsc::Sender<ControlMessage>,
    connector_id: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let roots = root_store_from_pem(ca_pem.as_bytes())?;
    let tls_config = server_config_require_mtls(roots, store)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "connector server listening");

    let incoming = tls_incoming(listener, acceptor, cancel.clone());
    let service = InboundControlPlane::new(connector_id, relay);

    Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .add_service(ControlPlaneServer::with_interceptor(
            service,
            require_identity_with_allowlist(
                trust_domain.clone(),
                vec![WorkloadRole::Tunneler],
                allowlist,
            ),
        ))
        .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_identity::spiffe::SpiffeId;
    use tether_proto::envelope::kind;

    fn tunneler_peer(id: &str) -> PeerIdentity {
        PeerIdentity {
            spiffe_id: SpiffeId::parse(&format!("spiffe://mycorp.internal/tunneler/{id}"))
                .unwrap(),
            serial: "01".to_string(),
        }
    }

    fn heartbeat_from_wire() -> ControlMessage {
        // What a tunneler actually sends: payload identity plus a status
        // field on the envelope.
        let mut msg = ControlEvent::TunnelerHeartbeat(TunnelerHeartbeat {
            tunneler_id: "spoofed".to_string(),
            spiffe_id: "spiffe://mycorp.internal/tunneler/spoofed".to_string(),
            status: String::new(),
            connector_id: String::new(),
        })
        .into_message();
        msg.status = "ONLINE".to_string();
        msg
    }

    #[tokio::test]
    async fn relays_heartbeats_under_the_verified_identity() {
        let (relay_tx, mut relay_rx) = mpsc::channel(16);
        let (reply, _mailbox) = mpsc::channel(8);
        let peer = tunneler_peer("t1");

        let inbound = tokio_stream::iter(vec![
            Ok(ControlEvent::TunnelerHello.into_message()),
            Ok(heartbeat_from_wire()),
        ]);
        relay_inbound(inbound, reply, relay_tx, &peer, "c1").await;

        let relayed = relay_rx.recv().await.unwrap();
        let ControlEvent::TunnelerHeartbeat(hb) = ControlEvent::decode(&relayed).unwrap() else {
            panic!("expected tunneler_heartbeat");
        };
        // The payload identity is overwritten by the peer certificate's.
        assert_eq!(hb.tunneler_id, "t1");
        assert_eq!(hb.spiffe_id, "spiffe://mycorp.internal/tunneler/t1");
        assert_eq!(hb.status, "ONLINE");
        assert_eq!(hb.connector_id, "c1");
    }

    #[tokio::test]
    async fn ping_is_answered_without_relaying() {
        let (relay_tx, mut relay_rx) = mpsc::channel(16);
        let (reply, mut mailbox) = mpsc::channel(8);
        let peer = tunneler_peer("t1");

        let inbound = tokio_stream::iter(vec![Ok(ControlEvent::Ping.into_message())]);
        relay_inbound(inbound, reply, relay_tx, &peer, "c1").await;

        assert_eq!(mailbox.recv().await.unwrap().r#type, kind::PONG);
        assert!(relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_overflow_drops_silently() {
        let (relay_tx, mut relay_rx) = mpsc::channel(1);
        let (reply, _mailbox) = mpsc::channel(8);
        let peer = tunneler_peer("t1");

        let inbound = tokio_stream::iter(vec![
            Ok(heartbeat_from_wire()),
            Ok(heartbeat_from_wire()),
            Ok(heartbeat_from_wire()),
        ]);
        relay_inbound(inbound, reply, relay_tx, &peer, "c1").await;

        // Only the first fit; the rest were dropped, not blocked on.
        assert!(relay_rx.try_recv().is_ok());
        assert!(relay_rx.try_recv().is_err());
    }
}
