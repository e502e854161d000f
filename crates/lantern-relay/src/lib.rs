//! # Lantern Relay
//!
//! Circuit relay for peers that cannot reach each other directly.
//!
//! A peer behind NAT (or a browser that can only dial) first *reserves* a
//! slot on the relay. Any other peer may then ask the relay to *connect* it
//! to the reserved peer; the relay dials the destination with a *stop*
//! request and splices the two streams into a circuit.
//!
//! ## Architecture
//!
//! ```text
//!   peer B                       relay                         peer A
//!     │                            │   RESERVE {A}                │
//!     │                            │◄─────────────────────────────│
//!     │                            │   OK, expires_at, limits     │
//!     │                            │─────────────────────────────►│
//!     │  CONNECT {A}               │                              │
//!     │───────────────────────────►│   STOP {B, limits}           │
//!     │                            │─────────────────────────────►│
//!     │                            │   OK                         │
//!     │  OK, limits                │◄─────────────────────────────│
//!     │◄───────────────────────────│                              │
//!     │ ◄═══════════ raw bytes, both directions, limited ═══════► │
//! ```
//!
//! - [`ReservationTable`]: admission-controlled reservations with expiry
//! - [`CircuitForwarder`]: full-duplex splicing with data/duration limits
//! - [`RelayService`]: the relay side of the wire protocol
//! - [`RelayClient`]: the peer side of the wire protocol
//!
//! ## Example
//!
//! ```no_run
//! use lantern_relay::{RelayClient, RelayConfig, RelayService};
//! use lantern_transport::{MemoryNetwork, MemoryTransport, ProtocolHandler, Transport};
//! use lantern_crypto::Identity;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let relay_transport = Arc::new(MemoryTransport::new(&network, Identity::generate().peer_id()));
//! let relay_id = relay_transport.local_peer();
//! let service = RelayService::new(relay_transport.clone(), RelayConfig::default());
//!
//! tokio::spawn(async move {
//!     while let Ok(inbound) = relay_transport.accept().await {
//!         service.handle(inbound).await;
//!     }
//! });
//!
//! let peer = Arc::new(MemoryTransport::new(&network, Identity::generate().peer_id()));
//! let client = RelayClient::new(peer, relay_id);
//! let grant = client.reserve().await?;
//! println!("Reserved until {}", grant.expires_at);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reservation;
pub mod service;

pub use circuit::{
    Circuit, CircuitForwarder, CircuitId, CircuitPermit, CircuitState, CloseReason,
    ForwarderConfig, ForwarderStats,
};
pub use client::{RelayClient, RelayedStream, ReservationGrant};
pub use config::RelayConfig;
pub use error::{CapacityScope, CircuitError, RelayError, RelayResult, ReservationError};
pub use protocol::{
    CONNECT_PROTOCOL, CircuitLimits, ConnectRequest, ConnectResponse, RESERVE_PROTOCOL,
    ReserveRequest, ReserveResponse, STOP_PROTOCOL, Status, StopRequest, StopResponse,
};
pub use reservation::{Reservation, ReservationTable};
pub use service::RelayService;
