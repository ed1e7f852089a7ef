//! Control-plane gRPC service: the persistent connector stream.
//!
//! On accept the connector immediately receives a full allowlist snapshot;
//! deltas follow via the hub. Inbound messages update the presence
//! registries. The stream's mailbox doubles as the reply path for pongs so
//! no lock is ever held across a send.

use std::pin::Pin;
use std::sync::Arc;

use tether_identity::spiffe::WorkloadRole;
use tether_proto::control_plane_server::ControlPlane;
use tether_proto::envelope::ControlEvent;
use tether_proto::ControlMessage;
use tether_tls::PeerIdentity;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::hub::Hub;
use crate::state::{ConnectorRegistry, TunnelerDirectory, TunnelerPresence};

pub struct ControlPlaneApi {
    pub connectors: Arc<ConnectorRegistry>,
    pub presence: Arc<TunnelerPresence>,
    pub directory: Arc<TunnelerDirectory>,
    pub hub: Arc<Hub>,
}

type ConnectStream = Pin<Box<dyn Stream<Item = Result<ControlMessage, Status>> + Send>>;

#[tonic::async_trait]
impl ControlPlane for ControlPlaneApi {
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
        if peer.role() != WorkloadRole::Connector {
            return Err(Status::permission_denied("connector role required"));
        }

        let key = peer.spiffe_id.to_string();
        tracing::info!(spiffe = %key, "control-plane stream connected");

        let inbound = request.into_inner();
        let (reply, mailbox) = self.hub.subscribe(&key);

        // Full snapshot on accept; reconnecting connectors reconcile from
        // this and treat later deltas as additive.
        let snapshot = ControlEvent::TunnelerAllowlist(self.directory.snapshot()).into_message();
        if reply.try_send(snapshot).is_err() {
            tracing::warn!(spiffe = %key, "failed to queue allowlist snapshot");
        }

        let hub = self.hub.clone();
        let connectors = self.connectors.clone();
        let presence = self.presence.clone();
        tokio::spawn(async move {
            handle_inbound(inbound, reply, connectors, presence).await;
            hub.unsubscribe(&key);
            tracing::info!(spiffe = %key, "control-plane stream closed");
        });

        let outbound = ReceiverStream::new(mailbox).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}

/// Drains one connector's inbound stream until it ends or errors.
async fn handle_inbound<S>(
    mut inbound: S,
    reply: mpsc::Sender<ControlMessage>,
    connectors: Arc<ConnectorRegistry>,
    presence: Arc<TunnelerPresence>,
) where
    S: Stream<Item = Result<ControlMessage, Status>> + Unpin,
{
    loop {
        let msg = match inbound.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "control stream receive error");
                return;
            }
            None => return,
        };

        match ControlEvent::decode(&msg) {
            Ok(ControlEvent::Ping) => {
                let _ = reply.try_send(ControlEvent::Pong.into_message());
            }
            Ok(ControlEvent::Heartbeat {
                connector_id,
                private_ip,
                status,
            }) => {
                tracing::debug!(
                    connector_id = %connector_id,
                    private_ip = %private_ip,
                    status = %status,
                    "heartbeat"
                );
                connectors.record_heartbeat(&connector_id, &private_ip);
            }
            Ok(ControlEvent::TunnelerHeartbeat(hb)) => {
                presence.record(&hb.tunneler_id, &hb.spiffe_id, &hb.connector_id);
            }
            Ok(ControlEvent::ConnectorHello) => {}
            Ok(other) => {
                tracing::debug!(event = ?other, "ignoring unexpected control message");
            }
            Err(e) => {
                tracing::debug!(error = %e, "undecodable control message");
            }
        }
    }
}
