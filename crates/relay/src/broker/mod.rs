// Connection registry and fan-out broker.
//
// One broadcast channel per actively-subscribed document. The channel
// is the fan-out mechanism itself: whichever task accepts an edit
// publishes once, and the document's fan-out loop re-delivers to every
// locally registered subscriber, rendered per subscriber. Delivery
// failure to one subscriber removes only that subscriber.
//
// The registry is an explicit, injectable object (created at process
// start, passed into the router) so tests can run several independent
// registries in one process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use formsync_common::protocol::ws::{LiveUpdate, WsMessage};
use formsync_common::types::AccessLevel;

const BROADCAST_CHANNEL_CAPACITY: usize = 64;

/// One live subscriber: ties a transport session to its requested
/// operation and granted access level.
#[derive(Debug, Clone)]
struct Subscriber {
    operation_id: String,
    access_level: AccessLevel,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

struct DocChannel {
    broadcast: broadcast::Sender<LiveUpdate>,
    subscribers: HashMap<Uuid, Subscriber>,
}

#[derive(Default)]
struct RegistryInner {
    docs: RwLock<HashMap<Uuid, DocChannel>>,
    /// connection_id -> doc_id, for unsubscribe-by-connection.
    connections: RwLock<HashMap<Uuid, Uuid>>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection as a subscriber of `doc_id`.
    ///
    /// The first subscriber for a document opens its broadcast channel
    /// and fan-out loop. A second subscribe with the same connection id
    /// replaces the earlier registration (the older outbound sender is
    /// dropped, which ends that socket's write loop).
    pub async fn subscribe(
        &self,
        doc_id: Uuid,
        connection_id: Uuid,
        operation_id: String,
        access_level: AccessLevel,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) {
        let mut docs = self.inner.docs.write().await;
        let channel = docs.entry(doc_id).or_insert_with(|| {
            let (sender, receiver) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
            self.spawn_fanout(doc_id, receiver);
            DocChannel { broadcast: sender, subscribers: HashMap::new() }
        });
        channel
            .subscribers
            .insert(connection_id, Subscriber { operation_id, access_level, outbound });
        // Both maps change under the docs lock so registration is
        // atomic with respect to unsubscribe.
        self.inner.connections.write().await.insert(connection_id, doc_id);
        drop(docs);
        debug!(doc_id = %doc_id, connection_id = %connection_id, "subscriber registered");
    }

    /// Publish a live update on the document's broadcast channel.
    ///
    /// A document with no open channel has no subscribers; the update
    /// is simply not delivered anywhere (the flush path still persists
    /// it independently of any live audience).
    pub async fn publish(&self, doc_id: Uuid, update: LiveUpdate) {
        let docs = self.inner.docs.read().await;
        if let Some(channel) = docs.get(&doc_id) {
            // Err means no active receiver, i.e. the fan-out loop is
            // gone; teardown is already underway.
            let _ = channel.broadcast.send(update);
        }
    }

    /// Remove a connection; tears the document's channel down when the
    /// last subscriber leaves (an immediate resubscribe reopens it).
    ///
    /// `outbound` identifies *which* registration is leaving: a stale
    /// session closing after its connection id was replaced by a newer
    /// socket must not evict the replacement, so removal only happens
    /// when the registered sender is the caller's own channel.
    pub async fn unsubscribe(
        &self,
        connection_id: Uuid,
        outbound: &mpsc::UnboundedSender<WsMessage>,
    ) {
        let Some(doc_id) = self.inner.connections.read().await.get(&connection_id).copied()
        else {
            return;
        };

        let mut docs = self.inner.docs.write().await;
        let Some(channel) = docs.get_mut(&doc_id) else { return };
        let is_own = channel
            .subscribers
            .get(&connection_id)
            .is_some_and(|subscriber| subscriber.outbound.same_channel(outbound));
        if !is_own {
            return;
        }

        channel.subscribers.remove(&connection_id);
        if channel.subscribers.is_empty() {
            // Dropping the sender closes the channel and ends the
            // fan-out loop.
            docs.remove(&doc_id);
            debug!(doc_id = %doc_id, "last subscriber left, channel closed");
        }
        // Still under the docs lock, so a racing resubscribe cannot
        // slip its fresh connections entry in between.
        self.inner.connections.write().await.remove(&connection_id);
    }

    pub async fn subscriber_count(&self, doc_id: Uuid) -> usize {
        self.inner.docs.read().await.get(&doc_id).map_or(0, |channel| channel.subscribers.len())
    }

    fn spawn_fanout(&self, doc_id: Uuid, mut receiver: broadcast::Receiver<LiveUpdate>) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let update = match receiver.recv().await {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(doc_id = %doc_id, skipped, "fan-out loop lagged behind publishes");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                registry.deliver(doc_id, update).await;
            }
        });
    }

    /// Render and deliver one update to every subscriber of `doc_id`.
    async fn deliver(&self, doc_id: Uuid, update: LiveUpdate) {
        let payload = match serde_json::to_value(&update) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(doc_id = %doc_id, error = %error, "failed to encode live update");
                return;
            }
        };

        let recipients: Vec<(Uuid, Subscriber)> = {
            let docs = self.inner.docs.read().await;
            match docs.get(&doc_id) {
                Some(channel) => channel
                    .subscribers
                    .iter()
                    .map(|(connection_id, subscriber)| (*connection_id, subscriber.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (connection_id, subscriber) in recipients {
            let message = WsMessage::Data {
                operation_id: subscriber.operation_id.clone(),
                payload: payload.clone(),
            };
            if subscriber.outbound.send(message).is_err() {
                dead.push((connection_id, subscriber));
            }
        }

        // A closed transport removes only that subscriber; delivery to
        // the rest has already happened.
        for (connection_id, subscriber) in dead {
            warn!(doc_id = %doc_id, connection_id = %connection_id, "removing dead subscriber");
            self.unsubscribe(connection_id, &subscriber.outbound).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formsync_common::types::EditRequest;

    fn update_for(doc_id: Uuid) -> LiveUpdate {
        LiveUpdate {
            resource_id: doc_id,
            connection_id: Uuid::new_v4(),
            delta: EditRequest { name: Some("renamed".to_string()), ..Default::default() },
        }
    }

    async fn recv_data(
        receiver: &mut mpsc::UnboundedReceiver<WsMessage>,
    ) -> Option<(String, serde_json::Value)> {
        let deadline = tokio::time::Duration::from_millis(500);
        match tokio::time::timeout(deadline, receiver.recv()).await {
            Ok(Some(WsMessage::Data { operation_id, payload })) => Some((operation_id, payload)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();

        let (sender_a, mut receiver_a) = mpsc::unbounded_channel();
        let (sender_b, mut receiver_b) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-a".into(), AccessLevel::Edit, sender_a)
            .await;
        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-b".into(), AccessLevel::View, sender_b)
            .await;

        registry.publish(doc_id, update_for(doc_id)).await;

        let (op_a, payload_a) = recv_data(&mut receiver_a).await.expect("subscriber a delivery");
        let (op_b, payload_b) = recv_data(&mut receiver_b).await.expect("subscriber b delivery");
        assert_eq!(op_a, "op-a");
        assert_eq!(op_b, "op-b");
        assert_eq!(payload_a["delta"]["name"], "renamed");
        assert_eq!(payload_b["delta"]["name"], "renamed");
    }

    #[tokio::test]
    async fn unsubscribed_connection_stops_receiving() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();
        let leaving = Uuid::new_v4();

        let (sender_a, mut receiver_a) = mpsc::unbounded_channel();
        let (sender_b, mut receiver_b) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, leaving, "op-a".into(), AccessLevel::View, sender_a.clone())
            .await;
        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-b".into(), AccessLevel::View, sender_b)
            .await;

        registry.publish(doc_id, update_for(doc_id)).await;
        assert!(recv_data(&mut receiver_a).await.is_some());
        assert!(recv_data(&mut receiver_b).await.is_some());

        registry.unsubscribe(leaving, &sender_a).await;
        registry.publish(doc_id, update_for(doc_id)).await;

        assert!(recv_data(&mut receiver_b).await.is_some());
        assert!(recv_data(&mut receiver_a).await.is_none());
        assert_eq!(registry.subscriber_count(doc_id).await, 1);
    }

    #[tokio::test]
    async fn dead_transport_removes_only_that_subscriber() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();

        let (sender_dead, receiver_dead) = mpsc::unbounded_channel();
        drop(receiver_dead);
        let (sender_live, mut receiver_live) = mpsc::unbounded_channel();

        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-dead".into(), AccessLevel::View, sender_dead)
            .await;
        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-live".into(), AccessLevel::View, sender_live)
            .await;

        registry.publish(doc_id, update_for(doc_id)).await;

        assert!(recv_data(&mut receiver_live).await.is_some());
        // Give the fan-out loop a beat to prune the dead entry.
        tokio::task::yield_now().await;
        assert_eq!(registry.subscriber_count(doc_id).await, 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_tears_channel_down_and_resubscribe_reopens() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let (sender, _receiver) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, connection_id, "op".into(), AccessLevel::View, sender.clone())
            .await;
        assert_eq!(registry.subscriber_count(doc_id).await, 1);

        registry.unsubscribe(connection_id, &sender).await;
        assert_eq!(registry.subscriber_count(doc_id).await, 0);

        let (sender, mut receiver) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, Uuid::new_v4(), "op-2".into(), AccessLevel::View, sender)
            .await;
        registry.publish(doc_id, update_for(doc_id)).await;
        assert!(recv_data(&mut receiver).await.is_some());
    }

    #[tokio::test]
    async fn same_connection_resubscribe_replaces_registration() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let (sender_old, _receiver_old) = mpsc::unbounded_channel();
        let (sender_new, mut receiver_new) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, connection_id, "op-old".into(), AccessLevel::View, sender_old)
            .await;
        registry
            .subscribe(doc_id, connection_id, "op-new".into(), AccessLevel::View, sender_new)
            .await;

        assert_eq!(registry.subscriber_count(doc_id).await, 1);
        registry.publish(doc_id, update_for(doc_id)).await;
        let (operation_id, _) = recv_data(&mut receiver_new).await.expect("delivery");
        assert_eq!(operation_id, "op-new");
    }

    #[tokio::test]
    async fn stale_unsubscribe_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let doc_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let (sender_old, _receiver_old) = mpsc::unbounded_channel();
        let (sender_new, mut receiver_new) = mpsc::unbounded_channel();
        registry
            .subscribe(doc_id, connection_id, "op-old".into(), AccessLevel::View, sender_old.clone())
            .await;
        registry
            .subscribe(doc_id, connection_id, "op-new".into(), AccessLevel::View, sender_new.clone())
            .await;

        // The stale session closes after being replaced; the newer
        // registration must survive.
        registry.unsubscribe(connection_id, &sender_old).await;
        assert_eq!(registry.subscriber_count(doc_id).await, 1);

        registry.publish(doc_id, update_for(doc_id)).await;
        let (operation_id, _) = recv_data(&mut receiver_new).await.expect("delivery");
        assert_eq!(operation_id, "op-new");

        // The replacement can still remove itself.
        registry.unsubscribe(connection_id, &sender_new).await;
        assert_eq!(registry.subscriber_count(doc_id).await, 0);
    }

    #[tokio::test]
    async fn publishes_on_different_documents_are_independent() {
        let registry = ConnectionRegistry::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        let (sender_a, mut receiver_a) = mpsc::unbounded_channel();
        registry.subscribe(doc_a, Uuid::new_v4(), "op-a".into(), AccessLevel::View, sender_a).await;

        registry.publish(doc_b, update_for(doc_b)).await;
        assert!(recv_data(&mut receiver_a).await.is_none());
    }
}
