//! # Lantern Node
//!
//! Composes the Lantern layers into a running relay node:
//!
//! - [`lantern_transport`] listeners feeding an [`AddressRegistry`]
//! - the [`RelayService`] (reservations and circuits) behind an inbound
//!   protocol dispatcher
//! - the [`DiscoveryPublisher`] announcing the registry on the discovery
//!   topic
//!
//! [`Node`] owns startup order and graceful shutdown; [`NodeConfig`] carries
//! every knob with production defaults.
//!
//! [`AddressRegistry`]: lantern_transport::AddressRegistry
//! [`RelayService`]: lantern_relay::RelayService
//! [`DiscoveryPublisher`]: lantern_discovery::DiscoveryPublisher

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod node;

pub use config::{DEFAULT_PORT, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use node::Node;
