//! Pub/sub message bus shared by gateway instances.

use async_trait::async_trait;
use bytes::Bytes;
use hatch_core::HatchResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Messages published to one topic after `subscribe` returned.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns how many subscribers received the message.
    async fn publish(&self, topic: &str, payload: Bytes) -> HatchResult<usize>;

    async fn subscribe(&self, topic: &str) -> HatchResult<Subscription>;
}

/// In-process bus. Several gateways in one test share a single instance.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> HatchResult<usize> {
        let mut topics = self.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return Ok(0);
        };
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            topics.remove(topic);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> HatchResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
