//! # Lantern Transport
//!
//! Stream transport layer for the Lantern relay node.
//!
//! The relay and discovery layers only ever see the [`Transport`] trait:
//! authenticated, ordered byte streams between two [`PeerId`]s, opened by
//! protocol id. This crate provides that abstraction plus:
//!
//! - [`MultiaddrExt`]: Lantern helpers on the standard [`Multiaddr`]
//! - [`AddressRegistry`]: the node's own advertised addresses, with change
//!   notification
//! - [`framing`]: length-prefixed bincode messages on top of a byte stream
//! - [`MemoryTransport`]: in-process transport for tests and embedding
//! - [`TcpTransport`]: TCP with a signed handshake and dial-back links for
//!   peers that cannot accept inbound connections
//!
//! ## Example
//!
//! ```no_run
//! use lantern_crypto::Identity;
//! use lantern_transport::{MemoryNetwork, MemoryTransport, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let alice = MemoryTransport::new(&network, Identity::generate().peer_id());
//! let bob = MemoryTransport::new(&network, Identity::generate().peer_id());
//!
//! let _stream = alice.open_stream(&bob.local_peer(), "/echo/1.0.0").await?;
//! let inbound = bob.accept().await?;
//! assert_eq!(inbound.peer, alice.local_peer());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod error;
pub mod framing;
pub mod memory;
pub mod registry;
pub mod tcp;
pub mod transport;

pub use addr::MultiaddrExt;
pub use error::{TransportError, TransportResult};
pub use lantern_crypto::PeerId;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use multiaddr::{Error as MultiaddrError, Multiaddr, Protocol};
pub use registry::AddressRegistry;
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{AsyncStream, ByteStream, InboundStream, ProtocolHandler, Transport};
