//! Transport trait abstraction for stream transports.
//!
//! This module defines the `Transport` trait that the relay and discovery
//! layers are written against. A transport authenticates the remote end of
//! every stream, so the [`PeerId`] attached to an [`InboundStream`] is the
//! peer that actually holds the corresponding key.

use crate::{Multiaddr, PeerId, TransportResult};
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream usable as a trait object
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream returned by transports
pub type ByteStream = Box<dyn AsyncStream>;

/// Stream opened by a remote peer
pub struct InboundStream {
    /// Authenticated remote peer
    pub peer: PeerId,
    /// Protocol id the remote requested
    pub protocol: String,
    /// The stream itself
    pub stream: ByteStream,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Async stream transport.
///
/// # Examples
///
/// ```no_run
/// use lantern_transport::{MemoryNetwork, MemoryTransport, Multiaddr, Transport};
/// use lantern_crypto::Identity;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = MemoryNetwork::new();
/// let transport = MemoryTransport::new(&network, Identity::generate().peer_id());
///
/// let bound = transport.listen(&"/memory/0".parse::<Multiaddr>()?).await?;
/// println!("Listening on {}", bound[0]);
///
/// let inbound = transport.accept().await?;
/// println!("{} opened {}", inbound.peer, inbound.protocol);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local end of every stream
    fn local_peer(&self) -> PeerId;

    /// Start listening on an address.
    ///
    /// # Returns
    /// The resolved addresses actually bound (port 0 replaced by the
    /// assigned port).
    ///
    /// # Errors
    /// Returns `TransportError::UnsupportedAddress` if the transport cannot
    /// handle `addr`, or `TransportError::BindFailed` if binding fails.
    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Vec<Multiaddr>>;

    /// Open an authenticated stream to `peer` speaking `protocol`.
    ///
    /// # Errors
    /// Returns `TransportError::PeerUnreachable` if no route to the peer is
    /// known, or another error if the stream cannot be established.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<ByteStream>;

    /// Wait for the next inbound stream.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport has been closed.
    async fn accept(&self) -> TransportResult<InboundStream>;

    /// Close the transport. Pending and future `accept` calls fail with
    /// `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns an error if releasing underlying resources fails.
    async fn close(&self) -> TransportResult<()>;

    /// Whether the transport has been closed
    fn is_closed(&self) -> bool;

    /// Whether `listen` accepts this address
    fn supports(&self, addr: &Multiaddr) -> bool;
}

/// Handler for inbound streams of one or more protocol ids
///
/// The node's dispatcher routes every accepted [`InboundStream`] to the
/// handler registered for its protocol and runs `handle` on its own task.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol ids this handler serves
    fn protocols(&self) -> Vec<&'static str>;

    /// Serve one inbound stream to completion
    async fn handle(&self, inbound: InboundStream);
}
