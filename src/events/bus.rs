//! Message bus abstraction and in-process retained-message broker

use super::{BusMessage, QoS};
use crate::error::{Result, SyncError};
use crate::sync::topics::topic_matches;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Stream of messages matching a subscription.
///
/// The stream ending means the transport was lost; the subscriber has to
/// reconnect and subscribe again.
pub type Subscription = BoxStream<'static, BusMessage>;

/// Topic-based publish/subscribe transport with retained messages
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Make sure the transport is usable
    async fn connect(&self) -> Result<()>;

    /// Publish a message. With `retain`, the bus keeps it as the last value
    /// of the topic and replays it to every new subscriber; an empty
    /// retained payload clears the topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    /// Subscribe to topic filters (`+` one level, `#` remaining levels).
    /// Retained messages matching any filter are delivered first.
    async fn subscribe(&self, filters: &[String]) -> Result<Subscription>;
}

struct Subscriber {
    filters: Vec<String>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }
}

#[derive(Default)]
struct BrokerState {
    online: bool,
    retained: BTreeMap<String, BusMessage>,
    subscribers: Vec<Subscriber>,
    published: Vec<BusMessage>,
}

/// In-process broker with MQTT retained-message semantics.
///
/// Used as the local-only transport and in tests. Clones share the same
/// broker.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::transport("broker state poisoned"))
    }

    fn online(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.lock()?;
        if state.online {
            Ok(state)
        } else {
            Err(SyncError::transport("broker unreachable"))
        }
    }

    /// Current retained message of a topic
    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.lock().ok()?.retained.get(topic).cloned()
    }

    /// Current retained payload of a topic, decoded as JSON
    pub fn retained_json(&self, topic: &str) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.retained(topic)?.payload).ok()
    }

    /// All retained topics, sorted
    pub fn retained_topics(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.retained.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<BusMessage> {
        self.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    /// Messages published so far on one topic, in order
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.lock()
            .map(|s| s.published.iter().filter(|m| m.topic == topic).cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_published(&self) {
        if let Ok(mut state) = self.lock() {
            state.published.clear();
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .map(|mut s| {
                s.subscribers.retain(|sub| !sub.sender.is_closed());
                s.subscribers.len()
            })
            .unwrap_or(0)
    }

    /// Drop every live subscription, ending their streams
    pub fn drop_connections(&self) {
        if let Ok(mut state) = self.lock() {
            state.subscribers.clear();
        }
    }

    /// Take the broker offline (every call fails, subscriptions end) or back online
    pub fn set_online(&self, online: bool) {
        if let Ok(mut state) = self.lock() {
            state.online = online;
            if !online {
                state.subscribers.clear();
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.online().map(|_| ())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        let mut state = self.online()?;
        let message = BusMessage::new(topic, payload, qos, retain);

        if message.is_clear() {
            state.retained.remove(topic);
        } else if retain {
            state.retained.insert(topic.to_string(), message.clone());
        }
        state.published.push(message.clone());

        let mut delivered = 0usize;
        state.subscribers.retain(|sub| {
            if !sub.wants(topic) {
                return !sub.sender.is_closed();
            }
            let ok = sub.sender.send(message.clone()).is_ok();
            delivered += usize::from(ok);
            ok
        });
        debug!(topic = %topic, retained = retain, subscribers = delivered, "Message published");
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<Subscription> {
        let mut state = self.online()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            filters: filters.to_vec(),
            sender,
        };

        for message in state.retained.values() {
            if subscriber.wants(&message.topic) {
                let _ = subscriber.sender.send(message.clone());
            }
        }
        state.subscribers.push(subscriber);
        debug!(filters = ?filters, "Subscribed");

        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn filters(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_retained_replayed_to_late_subscriber() {
        let bus = MemoryBus::new();
        bus.publish("ambulance/1/data", b"{\"id\":1}".to_vec(), QoS::AtLeastOnce, true)
            .await
            .unwrap();
        bus.publish("ambulance/1/data", b"{\"id\":1,\"v\":2}".to_vec(), QoS::AtLeastOnce, true)
            .await
            .unwrap();

        let mut sub = bus.subscribe(&filters(&["ambulance/+/data"])).await.unwrap();
        let message = sub.next().await.unwrap();
        assert_eq!(message.payload, b"{\"id\":1,\"v\":2}".to_vec());
        assert!(message.retained);
        assert_eq!(bus.retained_topics(), vec!["ambulance/1/data".to_string()]);
    }

    #[tokio::test]
    async fn test_non_retained_not_replayed() {
        let bus = MemoryBus::new();
        bus.publish("user/admin/ambulance/1/data", b"{}".to_vec(), QoS::AtMostOnce, false)
            .await
            .unwrap();
        assert!(bus.retained("user/admin/ambulance/1/data").is_none());
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_live_delivery_respects_filters() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&filters(&["hospital/#"])).await.unwrap();

        bus.publish("ambulance/1/data", b"a".to_vec(), QoS::AtMostOnce, true)
            .await
            .unwrap();
        bus.publish("hospital/1/equipment/rx/data", b"h".to_vec(), QoS::AtMostOnce, true)
            .await
            .unwrap();

        let message = sub.next().await.unwrap();
        assert_eq!(message.topic, "hospital/1/equipment/rx/data");
    }

    #[tokio::test]
    async fn test_empty_retained_payload_clears_topic() {
        let bus = MemoryBus::new();
        bus.publish("hospital/1/equipment/rx/data", b"x".to_vec(), QoS::AtMostOnce, true)
            .await
            .unwrap();
        bus.publish("hospital/1/equipment/rx/data", Vec::new(), QoS::AtMostOnce, true)
            .await
            .unwrap();
        assert!(bus.retained("hospital/1/equipment/rx/data").is_none());
    }

    #[tokio::test]
    async fn test_offline_bus_ends_streams_and_rejects_calls() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&filters(&["#"])).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        bus.set_online(false);
        assert!(sub.next().await.is_none());
        assert!(bus.connect().await.is_err());
        assert!(bus
            .publish("a/b", b"x".to_vec(), QoS::AtMostOnce, true)
            .await
            .unwrap_err()
            .is_transient());

        bus.set_online(true);
        assert!(bus.connect().await.is_ok());
    }
}
