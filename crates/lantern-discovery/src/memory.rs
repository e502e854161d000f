//! In-process gossip hub.
//!
//! [`MemoryGossip`] delivers every published message directly to the other
//! subscribers of the same topic name. It is the discovery counterpart of
//! `MemoryTransport` and backs the tests and single-process deployments.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::topic::{SUBSCRIPTION_QUEUE, Subscription, Topic, TopicMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use lantern_crypto::PeerId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

struct Subscriber {
    peer: PeerId,
    tx: mpsc::Sender<TopicMessage>,
}

/// Shared hub connecting [`MemoryTopic`] handles
#[derive(Clone, Default)]
pub struct MemoryGossip {
    topics: Arc<DashMap<String, Vec<Subscriber>>>,
}

impl MemoryGossip {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on topic `name` for `local`
    #[must_use]
    pub fn topic(&self, name: impl Into<String>, local: PeerId) -> MemoryTopic {
        MemoryTopic {
            hub: self.clone(),
            name: name.into(),
            local,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscriptions on `name`
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.topics
            .get(name)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, name: &str, source: PeerId, data: &[u8]) -> usize {
        let Some(mut subs) = self.topics.get_mut(name) else {
            return 0;
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.peer != source) {
            let message = TopicMessage {
                source,
                data: data.to_vec(),
            };
            match sub.tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::trace!("Dropped {} message for slow subscriber {}", name, sub.peer.short()),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for MemoryGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGossip")
            .field("topics", &self.topics.len())
            .finish()
    }
}

/// One peer's handle on a [`MemoryGossip`] topic
pub struct MemoryTopic {
    hub: MemoryGossip,
    name: String,
    local: PeerId,
    closed: AtomicBool,
}

impl MemoryTopic {
    /// Stop publishing and subscribing through this handle
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Live subscriptions on this topic across the whole hub
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count(&self.name)
    }

    fn ensure_open(&self) -> DiscoveryResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DiscoveryError::TopicClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> DiscoveryResult<()> {
        self.ensure_open()?;
        let delivered = self.hub.deliver(&self.name, self.local, &data);
        tracing::trace!("Published {} bytes on {} to {} subscribers", data.len(), self.name, delivered);
        Ok(())
    }

    fn subscribe(&self) -> DiscoveryResult<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.hub
            .topics
            .entry(self.name.clone())
            .or_default()
            .push(Subscriber { peer: self.local, tx });
        Ok(Subscription::new(rx))
    }
}

impl std::fmt::Debug for MemoryTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTopic")
            .field("name", &self.name)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers() {
        let hub = MemoryGossip::new();
        let a = hub.topic("t", peer(1));
        let b = hub.topic("t", peer(2));
        let c = hub.topic("other", peer(3));

        let mut sub_b = b.subscribe().unwrap();
        let mut sub_c = c.subscribe().unwrap();

        a.publish(b"hello".to_vec()).await.unwrap();
        let message = sub_b.next().await.unwrap();
        assert_eq!(message.source, peer(1));
        assert_eq!(message.data, b"hello");
        assert!(sub_c.try_next().is_none());
    }

    #[tokio::test]
    async fn test_no_echo_to_publisher() {
        let hub = MemoryGossip::new();
        let a = hub.topic("t", peer(1));
        let mut own = a.subscribe().unwrap();

        a.publish(b"x".to_vec()).await.unwrap();
        assert!(own.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_counted_out() {
        let hub = MemoryGossip::new();
        let a = hub.topic("t", peer(1));
        let sub = a.subscribe().unwrap();
        assert_eq!(a.subscriber_count(), 1);

        drop(sub);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_topic_refuses_use() {
        let hub = MemoryGossip::new();
        let a = hub.topic("t", peer(1));
        a.close();
        assert!(matches!(a.publish(vec![]).await, Err(DiscoveryError::TopicClosed)));
        assert!(matches!(a.subscribe(), Err(DiscoveryError::TopicClosed)));
    }
}
