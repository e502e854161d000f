//! Publish/subscribe topic abstraction.

use crate::error::DiscoveryResult;
use async_trait::async_trait;
use lantern_crypto::PeerId;
use tokio::sync::mpsc;

/// Default per-subscription queue depth
pub const SUBSCRIPTION_QUEUE: usize = 256;

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    /// Peer that originally published the message
    pub source: PeerId,
    /// Opaque payload
    pub data: Vec<u8>,
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<TopicMessage>,
}

impl Subscription {
    /// Wrap the receiving end of a topic's delivery channel
    #[must_use]
    pub fn new(rx: mpsc::Receiver<TopicMessage>) -> Self {
        Self { rx }
    }

    /// Wait for the next message. Returns `None` once the topic is gone.
    pub async fn next(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }

    /// Take a message that has already arrived, without waiting
    pub fn try_next(&mut self) -> Option<TopicMessage> {
        self.rx.try_recv().ok()
    }
}

/// A named gossip topic.
///
/// Published messages reach every other subscriber of the same topic on a
/// best-effort basis. A publisher never receives its own messages.
#[async_trait]
pub trait Topic: Send + Sync {
    /// Topic name
    fn name(&self) -> &str;

    /// Publish `data` to the topic
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::TopicClosed` if the topic has shut down.
    async fn publish(&self, data: Vec<u8>) -> DiscoveryResult<()>;

    /// Start receiving messages published by other peers
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::TopicClosed` if the topic has shut down.
    fn subscribe(&self) -> DiscoveryResult<Subscription>;
}
