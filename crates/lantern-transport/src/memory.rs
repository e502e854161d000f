//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub shared by any number of [`MemoryTransport`]s.
//! Streams are `tokio::io::duplex` pairs handed straight to the destination's
//! accept queue. Peer identities are taken at face value, so this transport is
//! for tests and single-process embedding only.

use crate::{
    ByteStream, InboundStream, Multiaddr, MultiaddrExt, PeerId, Transport, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Buffer size of each in-memory duplex pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// Accept queue depth per peer
const ACCEPT_QUEUE: usize = 128;

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    peers: DashMap<PeerId, mpsc::Sender<InboundStream>>,
    ports: DashMap<u64, PeerId>,
    next_port: AtomicU64,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    fn allocate_port(&self) -> u64 {
        self.inner.next_port.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("peers", &self.inner.peers.len())
            .field("ports", &self.inner.ports.len())
            .finish()
    }
}

/// One peer's attachment to a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
    registration: mpsc::Sender<InboundStream>,
    incoming: Mutex<mpsc::Receiver<InboundStream>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Attach `peer` to `network`
    ///
    /// The peer is reachable by [`Transport::open_stream`] immediately; a
    /// `listen` call only publishes a `/memory/<port>` address for it.
    #[must_use]
    pub fn new(network: &MemoryNetwork, peer: PeerId) -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        network.inner.peers.insert(peer, tx.clone());
        Self {
            network: network.clone(),
            local: peer,
            registration: tx,
            incoming: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Detach from the network without closing the accept side
    ///
    /// Subsequent dials to this peer fail with `PeerUnreachable`, which is
    /// how tests simulate a destination going offline.
    pub fn disconnect(&self) {
        // Only unregister if the slot is still ours; a newer transport may
        // have re-attached the same peer id.
        self.network
            .inner
            .peers
            .remove_if(&self.local, |_, sender| sender.same_channel(&self.registration));
        self.network
            .inner
            .ports
            .retain(|_, owner| *owner != self.local);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Vec<Multiaddr>> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let requested = addr
            .memory_port()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;

        let port = if requested == 0 {
            self.network.allocate_port()
        } else {
            requested
        };

        match self.network.inner.ports.entry(port) {
            Entry::Occupied(entry) if *entry.get() != self.local => {
                return Err(TransportError::BindFailed(format!(
                    "/memory/{port} already in use"
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(self.local);
            }
        }

        tracing::debug!("memory transport {} listening on /memory/{}", self.local.short(), port);
        Ok(vec![Multiaddr::memory(port)])
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<ByteStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let sender = self
            .network
            .inner
            .peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::PeerUnreachable(*peer))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = InboundStream {
            peer: self.local,
            protocol: protocol.to_string(),
            stream: Box::new(remote),
        };
        sender
            .send(inbound)
            .await
            .map_err(|_| TransportError::PeerUnreachable(*peer))?;

        tracing::trace!(
            "memory stream {} -> {} ({})",
            self.local.short(),
            peer.short(),
            protocol
        );
        Ok(Box::new(local))
    }

    async fn accept(&self) -> TransportResult<InboundStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            next = incoming.recv() => next.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        self.disconnect();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn supports(&self, addr: &Multiaddr) -> bool {
        addr.memory_port().is_some()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
