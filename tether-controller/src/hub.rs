//! Broadcast hub for connected connector streams.
//!
//! Each connected connector gets a bounded mailbox; publishers offer
//! messages with `try_send` and drop on overflow. No lock is ever held
//! across a network send: the stream task drains its own mailbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tether_proto::ControlMessage;
use tokio::sync::mpsc;

/// Per-subscriber mailbox depth.
const MAILBOX_CAPACITY: usize = 32;

#[derive(Default)]
pub struct Hub {
    subscribers: Mutex<HashMap<String, mpsc::Sender<ControlMessage>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscriber under `key`, replacing any previous stream
    /// for the same identity. Returns the mailbox sender (for replies from
    /// the stream's own task) and the receiver the outbound stream drains.
    pub fn subscribe(
        &self,
        key: &str,
    ) -> (mpsc::Sender<ControlMessage>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        subscribers.insert(key.to_string(), tx.clone());
        (tx, rx)
    }

    pub fn unsubscribe(&self, key: &str) {
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        subscribers.remove(key);
    }

    /// Offers a message to every subscriber. Best-effort and unordered:
    /// a full or closed mailbox drops the message for that subscriber.
    pub fn publish(&self, msg: &ControlMessage) {
        let targets: Vec<(String, mpsc::Sender<ControlMessage>)> = {
            let subscribers = self.subscribers.lock().expect("hub lock poisoned");
            subscribers
                .iter()
                .map(|(k, tx)| (k.clone(), tx.clone()))
                .collect()
        };

        for (key, tx) in targets {
            if let Err(e) = tx.try_send(msg.clone()) {
                tracing::warn!(subscriber = %key, error = %e, "dropping control message");
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subscribers.lock().expect("hub lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::envelope::{kind, ControlEvent, TunnelerEntry};

    fn allow_msg(id: &str) -> ControlMessage {
        ControlEvent::TunnelerAllow(TunnelerEntry {
            id: id.to_string(),
            spiffe_id: format!("spiffe://td/tunneler/{id}"),
        })
        .into_message()
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let hub = Hub::new();
        let (_tx1, mut rx1) = hub.subscribe("spiffe://td/connector/c1");
        let (_tx2, mut rx2) = hub.subscribe("spiffe://td/connector/c2");

        hub.publish(&allow_msg("t1"));

        assert_eq!(rx1.recv().await.unwrap().r#type, kind::TUNNELER_ALLOW);
        assert_eq!(rx2.recv().await.unwrap().r#type, kind::TUNNELER_ALLOW);
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let hub = Hub::new();
        let (_tx, mut rx) = hub.subscribe("spiffe://td/connector/c1");

        for i in 0..(MAILBOX_CAPACITY + 10) {
            hub.publish(&allow_msg(&format!("t{i}")));
        }

        // The mailbox holds at most its capacity; nothing blocked.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, MAILBOX_CAPACITY);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_stream() {
        let hub = Hub::new();
        let (_tx1, mut rx1) = hub.subscribe("spiffe://td/connector/c1");
        let (_tx2, mut rx2) = hub.subscribe("spiffe://td/connector/c1");
        assert_eq!(hub.len(), 1);

        hub.publish(&allow_msg("t1"));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_mailbox() {
        let hub = Hub::new();
        let _sub = hub.subscribe("spiffe://td/connector/c1");
        hub.unsubscribe("spiffe://td/connector/c1");
        assert_eq!(hub.len(), 0);
    }
}
