//! Flood gossip over the stream transport.
//!
//! Each neighbour link is one long-lived stream on [`GOSSIP_PROTOCOL`],
//! used in both directions regardless of which side opened it. Frames carry
//! `(origin, seqno)`; a peer delivers and forwards a frame only the first
//! time it sees that pair, so floods terminate on cyclic overlays.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::topic::{SUBSCRIPTION_QUEUE, Subscription, Topic, TopicMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use lantern_crypto::PeerId;
use lantern_transport::framing::{read_message, write_message};
use lantern_transport::{ByteStream, InboundStream, ProtocolHandler, Transport};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Protocol id of gossip links
pub const GOSSIP_PROTOCOL: &str = "/lantern/gossip/1.0.0";

/// Default number of `(origin, seqno)` pairs remembered for deduplication
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Outbound frames queued per neighbour before new ones are dropped
const NEIGHBOUR_QUEUE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FloodFrame {
    topic: String,
    origin: PeerId,
    seqno: u64,
    data: Vec<u8>,
}

/// A [`Topic`] flooded across transport neighbours
#[derive(Clone)]
pub struct FloodTopic {
    inner: Arc<FloodInner>,
}

struct FloodInner {
    name: String,
    transport: Arc<dyn Transport>,
    local: PeerId,
    neighbours: DashMap<PeerId, mpsc::Sender<FloodFrame>>,
    seen: Mutex<LruCache<(PeerId, u64), ()>>,
    subscribers: Mutex<Vec<mpsc::Sender<TopicMessage>>>,
    next_seqno: AtomicU64,
    closed: CancellationToken,
}

impl FloodTopic {
    /// Create topic `name` on `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, name: impl Into<String>) -> Self {
        Self::with_seen_capacity(transport, name, DEFAULT_SEEN_CAPACITY)
    }

    /// Create a topic remembering `capacity` message ids for deduplication
    #[must_use]
    pub fn with_seen_capacity(
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        // Random high half keeps seqnos distinct across restarts
        let start = u64::from(rand::random::<u32>()) << 32;

        Self {
            inner: Arc::new(FloodInner {
                name: name.into(),
                local: transport.local_peer(),
                transport,
                neighbours: DashMap::new(),
                seen: Mutex::new(LruCache::new(capacity)),
                subscribers: Mutex::new(Vec::new()),
                next_seqno: AtomicU64::new(start),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Open a gossip link to `peer`. A no-op if one already exists.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the stream cannot be opened.
    pub async fn add_neighbour(&self, peer: PeerId) -> DiscoveryResult<()> {
        if self.inner.closed.is_cancelled() {
            return Err(DiscoveryError::TopicClosed);
        }
        if self.inner.neighbours.contains_key(&peer) {
            return Ok(());
        }

        let stream = self.inner.transport.open_stream(&peer, GOSSIP_PROTOCOL).await?;
        let (tx, rx) = mpsc::channel(NEIGHBOUR_QUEUE);
        self.inner.neighbours.insert(peer, tx.clone());
        tracing::debug!("Gossip link to {} opened", peer.short());

        let this = self.clone();
        tokio::spawn(async move { this.run_link(peer, stream, tx, rx).await });
        Ok(())
    }

    /// Peers with a live gossip link
    #[must_use]
    pub fn neighbours(&self) -> Vec<PeerId> {
        self.inner.neighbours.iter().map(|e| *e.key()).collect()
    }

    /// Tear down every link and refuse further use
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.neighbours.clear();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn run_link(
        &self,
        peer: PeerId,
        stream: ByteStream,
        tx: mpsc::Sender<FloodFrame>,
        mut rx: mpsc::Receiver<FloodFrame>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let writing = async {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &frame).await {
                    tracing::debug!("Gossip write to {} failed: {}", peer.short(), e);
                    break;
                }
            }
        };
        let reading = async {
            loop {
                match read_message::<_, FloodFrame>(&mut reader).await {
                    Ok(frame) => self.on_frame(peer, frame),
                    Err(e) => {
                        tracing::debug!("Gossip link to {} ended: {}", peer.short(), e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            () = self.inner.closed.cancelled() => {}
            () = writing => {}
            () = reading => {}
        }

        // Only drop the entry if it still belongs to this link
        self.inner
            .neighbours
            .remove_if(&peer, |_, current| current.same_channel(&tx));
    }

    fn on_frame(&self, from: PeerId, frame: FloodFrame) {
        if frame.topic != self.inner.name {
            tracing::trace!("Ignoring gossip for topic {} from {}", frame.topic, from.short());
            return;
        }
        if frame.origin == self.inner.local || !self.mark_seen(frame.origin, frame.seqno) {
            return;
        }

        {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let _ = tx.try_send(TopicMessage {
                    source: frame.origin,
                    data: frame.data.clone(),
                });
            }
        }

        let origin = frame.origin;
        self.flood(&frame, |peer| peer != from && peer != origin);
    }

    /// Returns `true` the first time `(origin, seqno)` is seen
    fn mark_seen(&self, origin: PeerId, seqno: u64) -> bool {
        self.inner
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put((origin, seqno), ())
            .is_none()
    }

    fn flood(&self, frame: &FloodFrame, include: impl Fn(PeerId) -> bool) -> usize {
        let targets: Vec<(PeerId, mpsc::Sender<FloodFrame>)> = self
            .inner
            .neighbours
            .iter()
            .filter(|e| include(*e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut sent = 0;
        for (peer, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => tracing::trace!("Gossip queue to {} full, dropping frame", peer.short()),
            }
        }
        sent
    }
}

#[async_trait]
impl Topic for FloodTopic {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn publish(&self, data: Vec<u8>) -> DiscoveryResult<()> {
        if self.inner.closed.is_cancelled() {
            return Err(DiscoveryError::TopicClosed);
        }
        let seqno = self.inner.next_seqno.fetch_add(1, Ordering::Relaxed);
        self.mark_seen(self.inner.local, seqno);

        let frame = FloodFrame {
            topic: self.inner.name.clone(),
            origin: self.inner.local,
            seqno,
            data,
        };
        let sent = self.flood(&frame, |_| true);
        tracing::trace!("Flooded {} seqno {} to {} neighbours", self.inner.name, seqno, sent);
        Ok(())
    }

    fn subscribe(&self) -> DiscoveryResult<Subscription> {
        if self.inner.closed.is_cancelled() {
            return Err(DiscoveryError::TopicClosed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[async_trait]
impl ProtocolHandler for FloodTopic {
    fn protocols(&self) -> Vec<&'static str> {
        vec![GOSSIP_PROTOCOL]
    }

    async fn handle(&self, inbound: InboundStream) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        let peer = inbound.peer;
        let (tx, rx) = mpsc::channel(NEIGHBOUR_QUEUE);
        self.inner.neighbours.insert(peer, tx.clone());
        tracing::debug!("Gossip link from {} accepted", peer.short());
        self.run_link(peer, inbound.stream, tx, rx).await;
    }
}

impl std::fmt::Debug for FloodTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloodTopic")
            .field("name", &self.inner.name)
            .field("local", &self.inner.local)
            .field("neighbours", &self.inner.neighbours.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_crypto::Identity;
    use lantern_transport::{MemoryNetwork, MemoryTransport};
    use std::time::Duration;

    fn node(network: &MemoryNetwork) -> FloodTopic {
        let transport = Arc::new(MemoryTransport::new(network, Identity::generate().peer_id()));
        let topic = FloodTopic::new(transport.clone(), "t");
        let handler = topic.clone();
        tokio::spawn(async move {
            while let Ok(inbound) = transport.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(inbound).await });
            }
        });
        topic
    }

    fn local(topic: &FloodTopic) -> PeerId {
        topic.inner.local
    }

    async fn recv(sub: &mut Subscription) -> Option<TopicMessage> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .ok()
            .flatten()
    }

    async fn wait_for_neighbours(topic: &FloodTopic, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while topic.neighbours().len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_flood_crosses_intermediate_peer() {
        let network = MemoryNetwork::new();
        let a = node(&network);
        let b = node(&network);
        let c = node(&network);

        a.add_neighbour(local(&b)).await.unwrap();
        b.add_neighbour(local(&c)).await.unwrap();

        let mut sub_c = c.subscribe().unwrap();
        a.publish(b"hello".to_vec()).await.unwrap();

        let message = recv(&mut sub_c).await.unwrap();
        assert_eq!(message.source, local(&a));
        assert_eq!(message.data, b"hello");
    }

    #[tokio::test]
    async fn test_inbound_link_is_bidirectional() {
        let network = MemoryNetwork::new();
        let a = node(&network);
        let b = node(&network);

        a.add_neighbour(local(&b)).await.unwrap();
        wait_for_neighbours(&b, 1).await;

        let mut sub_a = a.subscribe().unwrap();
        b.publish(b"back".to_vec()).await.unwrap();
        assert_eq!(recv(&mut sub_a).await.unwrap().data, b"back");
    }

    #[tokio::test]
    async fn test_triangle_delivers_once() {
        let network = MemoryNetwork::new();
        let a = node(&network);
        let b = node(&network);
        let c = node(&network);

        a.add_neighbour(local(&b)).await.unwrap();
        a.add_neighbour(local(&c)).await.unwrap();
        b.add_neighbour(local(&c)).await.unwrap();
        wait_for_neighbours(&c, 2).await;

        let mut sub_c = c.subscribe().unwrap();
        a.publish(b"once".to_vec()).await.unwrap();

        assert_eq!(recv(&mut sub_c).await.unwrap().data, b"once");
        let again = tokio::time::timeout(Duration::from_millis(200), sub_c.next()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_closed_topic_refuses_use() {
        let network = MemoryNetwork::new();
        let a = node(&network);
        a.close();
        assert!(matches!(a.publish(vec![1]).await, Err(DiscoveryError::TopicClosed)));
        assert!(matches!(a.subscribe(), Err(DiscoveryError::TopicClosed)));
    }

    #[tokio::test]
    async fn test_seen_is_first_time_only() {
        let network = MemoryNetwork::new();
        let transport = Arc::new(MemoryTransport::new(&network, PeerId::from_bytes([1; 32])));
        let topic = FloodTopic::with_seen_capacity(transport, "t", 2);
        let origin = PeerId::from_bytes([2; 32]);

        assert!(topic.mark_seen(origin, 1));
        assert!(!topic.mark_seen(origin, 1));
        assert!(topic.mark_seen(origin, 2));
        assert!(topic.mark_seen(origin, 3));
        // Capacity 2: the oldest id has been forgotten
        assert!(topic.mark_seen(origin, 1));
    }
}
