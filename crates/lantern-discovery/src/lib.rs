//! # Lantern Discovery
//!
//! Address discovery for the Lantern relay node.
//!
//! A node periodically signs its current address list and publishes it on a
//! well-known gossip topic ([`DEFAULT_TOPIC`]). Browsers and other relays
//! subscribed to the topic learn where to reach it; the node in turn keeps
//! the freshest verified announcement from every peer it hears.
//!
//! - [`Announcement`]: signed `(peer, addresses, sequence)` record
//! - [`Topic`]: publish/subscribe seam the publisher is written against
//! - [`MemoryGossip`]: in-process topic hub
//! - [`FloodTopic`]: flood gossip across transport neighbours
//! - [`DiscoveryPublisher`]: heartbeat and change-driven publishing plus
//!   verified ingestion
//!
//! ## Example
//!
//! ```no_run
//! use lantern_crypto::Identity;
//! use lantern_discovery::{DiscoveryConfig, DiscoveryPublisher, MemoryGossip};
//! use lantern_transport::AddressRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Arc::new(Identity::generate());
//! let hub = MemoryGossip::new();
//! let topic = Arc::new(hub.topic("browser-peer-discovery", identity.peer_id()));
//!
//! let registry = AddressRegistry::new();
//! registry.add("/ip4/127.0.0.1/tcp/9095".parse()?);
//!
//! let publisher = DiscoveryPublisher::new(identity, topic, registry, DiscoveryConfig::default());
//! publisher.join()?;
//! publisher.publish().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announcement;
pub mod error;
pub mod flood;
pub mod memory;
pub mod publisher;
pub mod topic;

pub use announcement::Announcement;
pub use error::{DiscoveryError, DiscoveryResult};
pub use flood::{FloodTopic, GOSSIP_PROTOCOL};
pub use memory::{MemoryGossip, MemoryTopic};
pub use publisher::{DEFAULT_TOPIC, DiscardReason, DiscoveryConfig, DiscoveryPublisher, Ingest};
pub use topic::{Subscription, Topic, TopicMessage};
