//! In-process topic hub and the transport built on it.
//!
//! The relay binary fans websocket clients out through the same hub, so the
//! ordering guarantee is identical in tests and in deployment.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChannelEvent, ChannelTransport, Notification, Subscription, TransportError, TransportResult,
};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Topic fan-out with a total order per topic
#[derive(Default)]
pub struct TopicHub {
    topics: DashMap<String, Arc<Mutex<Vec<Subscriber>>>>,
    next_id: AtomicU64,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver on `topic`
    pub fn subscribe(&self, topic: &str) -> (u64, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        // Pushed under the shard lock that `unsubscribe` removes topics under
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .value()
            .lock()
            .push(Subscriber { id, tx });
        debug!("Subscriber {} joined topic {}", id, topic);
        (id, rx)
    }

    /// Returns true when the topic has no subscribers left
    pub fn unsubscribe(&self, topic: &str, id: u64) -> bool {
        let Some(subscribers) = self.topics.get(topic).map(|entry| entry.value().clone()) else {
            return true;
        };
        let mut subscribers = subscribers.lock();
        subscribers.retain(|s| s.id != id);
        let empty = subscribers.is_empty();
        drop(subscribers);

        if empty {
            self.topics.remove_if(topic, |_, subs| subs.lock().is_empty());
        }
        empty
    }

    /// Deliver to every subscriber of the notification's topic.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, notification: Notification) -> usize {
        let Some(subscribers) = self
            .topics
            .get(&notification.topic)
            .map(|entry| entry.value().clone())
        else {
            return 0;
        };

        // Sending under the lock keeps one order for every subscriber
        let mut subscribers = subscribers.lock();
        subscribers.retain(|s| s.tx.send(notification.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.lock().len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Transport over a shared [`TopicHub`]
pub struct MemoryTransport {
    client_id: String,
    hub: Arc<TopicHub>,
    offline: AtomicBool,
}

impl MemoryTransport {
    pub fn connect(hub: Arc<TopicHub>) -> Self {
        Self::with_client_id(hub, crate::new_id())
    }

    pub fn with_client_id(hub: Arc<TopicHub>, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            hub,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate losing the connection; publishes fail until restored
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> TransportResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<Subscription> {
        self.ensure_online()?;
        let (id, rx) = self.hub.subscribe(topic);
        Ok(Subscription::new(topic, id, rx))
    }

    async fn publish(&self, topic: &str, event: ChannelEvent) -> TransportResult<()> {
        self.ensure_online()?;
        self.hub.publish(Notification {
            topic: topic.to_string(),
            origin_id: self.client_id.clone(),
            event,
        });
        Ok(())
    }

    async fn unsubscribe(&self, subscription: Subscription) -> TransportResult<()> {
        self.hub.unsubscribe(&subscription.topic, subscription.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(user: &str, at: i64) -> ChannelEvent {
        ChannelEvent::Heartbeat {
            user_id: user.to_string(),
            at,
        }
    }

    #[tokio::test]
    async fn test_publisher_receives_own_notification() {
        let hub = Arc::new(TopicHub::new());
        let alice = MemoryTransport::with_client_id(hub, "alice");

        let mut sub = alice.subscribe("t").await.unwrap();
        alice.publish("t", heartbeat("alice", 1)).await.unwrap();

        let notification = sub.recv().await.unwrap();
        assert_eq!(notification.origin_id, "alice");
        assert_eq!(notification.event, heartbeat("alice", 1));
    }

    #[tokio::test]
    async fn test_total_order_per_topic() {
        let hub = Arc::new(TopicHub::new());
        let alice = MemoryTransport::with_client_id(hub.clone(), "alice");
        let bob = MemoryTransport::with_client_id(hub.clone(), "bob");

        let mut at_alice = alice.subscribe("t").await.unwrap();
        let mut at_bob = bob.subscribe("t").await.unwrap();

        for i in 0..10 {
            let (sender, name) = if i % 2 == 0 { (&alice, "alice") } else { (&bob, "bob") };
            sender.publish("t", heartbeat(name, i)).await.unwrap();
        }

        for _ in 0..10 {
            let a = at_alice.recv().await.unwrap();
            let b = at_bob.recv().await.unwrap();
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = Arc::new(TopicHub::new());
        let alice = MemoryTransport::connect(hub.clone());

        let sub = alice.subscribe("t").await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 1);

        alice.unsubscribe(sub).await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 0);
        assert_eq!(hub.topic_count(), 0);
        assert_eq!(
            hub.publish(Notification {
                topic: "t".to_string(),
                origin_id: "x".to_string(),
                event: heartbeat("x", 0),
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let hub = Arc::new(TopicHub::new());
        let transport = MemoryTransport::connect(hub.clone());

        let sub = transport.subscribe("t").await.unwrap();
        drop(sub);
        transport.publish("t", heartbeat("x", 0)).await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_offline_publish_fails() {
        let hub = Arc::new(TopicHub::new());
        let transport = MemoryTransport::connect(hub);
        transport.set_offline(true);

        let result = transport.publish("t", heartbeat("x", 0)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
