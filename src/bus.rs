//! In-process topic bus.
//!
//! Publish is fire-and-forget: a message to a topic nobody subscribes
//! to is dropped, and a slow subscriber loses the oldest messages in
//! its channel. Both are acceptable because durable state is the source
//! of truth — clients bootstrap from an authoritative snapshot on
//! connect and events only keep them fresh.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

/// Per-topic channel depth. A subscriber this far behind re-bootstraps.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

/// Topic name builders.
pub mod topics {
    pub fn drop_state(drop_id: &str) -> String {
        format!("drop.{drop_id}.state")
    }

    pub fn drop_user(drop_id: &str, user_id: &str) -> String {
        format!("drop.{drop_id}.user.{user_id}")
    }

    pub fn queue(drop_id: &str, token_id: &str) -> String {
        format!("queue.{drop_id}.{token_id}")
    }
}

pub struct Bus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to a topic. Never fails, never blocks.
    pub fn publish(&self, topic: &str, event: &str, payload: Value) {
        let message = BusEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };

        let delivered = {
            let channels = self.channels.read().expect("bus lock");
            channels
                .get(topic)
                .map(|tx| tx.send(message).is_ok())
                .unwrap_or(false)
        };

        if !delivered {
            trace!("bus: dropped {event} on {topic} (no subscribers)");
            // drop idle channels so topics do not accumulate forever
            let mut channels = self.channels.write().expect("bus lock");
            if let Some(tx) = channels.get(topic) {
                if tx.receiver_count() == 0 {
                    channels.remove(topic);
                }
            }
        }
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        let mut channels = self.channels.write().expect("bus lock");
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.channels.read().expect("bus lock").len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("drop.d1.state");
        bus.publish("drop.d1.state", "drop", json!({"phase": "registration"}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "drop");
        assert_eq!(msg.payload["phase"], "registration");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = Bus::new();
        bus.publish("drop.d9.state", "drop", json!({}));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_topics_isolated() {
        let bus = Bus::new();
        let mut rx1 = bus.subscribe(&topics::queue("d1", "t1"));
        let _rx2 = bus.subscribe(&topics::queue("d1", "t2"));
        bus.publish(&topics::queue("d1", "t1"), "queue_ready", json!({"position": 0}));
        let msg = rx1.recv().await.unwrap();
        assert_eq!(msg.event, "queue_ready");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let bus = Bus::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        bus.publish("t", "e", json!(1));
        assert_eq!(a.recv().await.unwrap().payload, json!(1));
        assert_eq!(b.recv().await.unwrap().payload, json!(1));
    }

    #[tokio::test]
    async fn test_idle_channel_cleaned_up() {
        let bus = Bus::new();
        {
            let _rx = bus.subscribe("t");
        }
        // receiver dropped; next publish removes the dead channel
        bus.publish("t", "e", json!(null));
        assert_eq!(bus.topic_count(), 0);
    }
}
