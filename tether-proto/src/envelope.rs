//! Typed view over the wire [`ControlMessage`] envelope.
//!
//! The protobuf message is a tagged variant: `type` selects the event and
//! `payload` carries a JSON body for the variants that have one. This module
//! gives every variant a statically defined schema so no handler touches raw
//! payload bytes.

use serde::{Deserialize, Serialize};

use crate::ControlMessage;

/// Wire values for `ControlMessage.type`.
pub mod kind {
    pub const CONNECTOR_HELLO: &str = "connector_hello";
    pub const TUNNELER_HELLO: &str = "tunneler_hello";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const TUNNELER_HEARTBEAT: &str = "tunneler_heartbeat";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const TUNNELER_ALLOWLIST: &str = "tunneler_allowlist";
    pub const TUNNELER_ALLOW: &str = "tunneler_allow";
}

/// One allowlist entry: a tunneler identity a connector will accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelerEntry {
    #[serde(rename = "tunneler_id")]
    pub id: String,
    pub spiffe_id: String,
}

/// Payload of a relayed tunneler heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelerHeartbeat {
    pub tunneler_id: String,
    pub spiffe_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub connector_id: String,
}

/// Decoded control-plane event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    ConnectorHello,
    TunnelerHello,
    Heartbeat {
        connector_id: String,
        private_ip: String,
        status: String,
    },
    TunnelerHeartbeat(TunnelerHeartbeat),
    Ping,
    Pong,
    TunnelerAllowlist(Vec<TunnelerEntry>),
    TunnelerAllow(TunnelerEntry),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown control message type {0:?}")]
    UnknownType(String),

    #[error("malformed {kind} payload: {source}")]
    BadPayload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

impl ControlEvent {
    /// Decode a wire message into its typed event.
    pub fn decode(msg: &ControlMessage) -> Result<Self, EnvelopeError> {
        fn parse(kind: &'static str) -> impl FnOnce(serde_json::Error) -> EnvelopeError {
            move |source| EnvelopeError::BadPayload { kind, source }
        }
        match msg.r#type.as_str() {
            kind::CONNECTOR_HELLO => Ok(Self::ConnectorHello),
            kind::TUNNELER_HELLO => Ok(Self::TunnelerHello),
            kind::HEARTBEAT => Ok(Self::Heartbeat {
                connector_id: msg.connector_id.clone(),
                private_ip: msg.private_ip.clone(),
                status: msg.status.clone(),
            }),
            kind::TUNNELER_HEARTBEAT => serde_json::from_slice(&msg.payload)
                .map(Self::TunnelerHeartbeat)
                .map_err(parse(kind::TUNNELER_HEARTBEAT)),
            kind::PING => Ok(Self::Ping),
            kind::PONG => Ok(Self::Pong),
            kind::TUNNELER_ALLOWLIST => serde_json::from_slice(&msg.payload)
                .map(Self::TunnelerAllowlist)
                .map_err(parse(kind::TUNNELER_ALLOWLIST)),
            kind::TUNNELER_ALLOW => serde_json::from_slice(&msg.payload)
                .map(Self::TunnelerAllow)
                .map_err(parse(kind::TUNNELER_ALLOW)),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }

    /// Encode the event into its wire form.
    pub fn into_message(self) -> ControlMessage {
        let mut msg = ControlMessage::default();
        match self {
            Self::ConnectorHello => msg.r#type = kind::CONNECTOR_HELLO.into(),
            Self::TunnelerHello => msg.r#type = kind::TUNNELER_HELLO.into(),
            Self::Heartbeat {
                connector_id,
                private_ip,
                status,
            } => {
                msg.r#type = kind::HEARTBEAT.into();
                msg.connector_id = connector_id;
                msg.private_ip = private_ip;
                msg.status = status;
            }
            Self::TunnelerHeartbeat(hb) => {
                msg.r#type = kind::TUNNELER_HEARTBEAT.into();
                msg.status = hb.status.clone();
                msg.payload = serde_json::to_vec(&hb).expect("heartbeat payload serializes");
            }
            Self::Ping => msg.r#type = kind::PING.into(),
            Self::Pong => msg.r#type = kind::PONG.into(),
            Self::TunnelerAllowlist(entries) => {
                msg.r#type = kind::TUNNELER_ALLOWLIST.into();
                msg.payload = serde_json::to_vec(&entries).expect("allowlist payload serializes");
            }
            Self::TunnelerAllow(entry) => {
                msg.r#type = kind::TUNNELER_ALLOW.into();
                msg.payload = serde_json::to_vec(&entry).expect("allow payload serializes");
            }
        }
        msg
    }
}
