//! Node configuration

use crate::error::{NodeError, NodeResult};
use lantern_crypto::PeerId;
use lantern_discovery::DiscoveryConfig;
use lantern_relay::RelayConfig;
use lantern_transport::{Multiaddr, MultiaddrExt};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default TCP listen port
pub const DEFAULT_PORT: u16 = 9095;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local addresses to bind
    pub listen: Vec<Multiaddr>,

    /// Externally visible addresses. When non-empty these are advertised
    /// instead of the bound listen addresses.
    pub announce: Vec<Multiaddr>,

    /// Gossip neighbours to link with at startup
    pub neighbours: Vec<PeerId>,

    /// Relay service configuration
    pub relay: RelayConfig,

    /// Whether to join the discovery topic
    pub discovery_enabled: bool,

    /// Discovery configuration
    pub discovery: DiscoveryConfig,

    /// Time in-flight circuits get to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: vec![Multiaddr::from_tcp(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_PORT,
            )))],
            announce: Vec::new(),
            neighbours: Vec::new(),
            relay: RelayConfig::default(),
            discovery_enabled: true,
            discovery: DiscoveryConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Check the configuration for values the node cannot run with
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` naming the first offending value.
    pub fn validate(&self) -> NodeResult<()> {
        if self.listen.is_empty() {
            return Err(NodeError::invalid_config("listen list is empty"));
        }
        if self.relay.max_reservations == 0 {
            return Err(NodeError::invalid_config("relay.max_reservations must be > 0"));
        }
        if self.relay.max_circuits == 0 {
            return Err(NodeError::invalid_config("relay.max_circuits must be > 0"));
        }
        if self.relay.max_circuits_per_peer == 0 {
            return Err(NodeError::invalid_config(
                "relay.max_circuits_per_peer must be > 0",
            ));
        }
        if self.relay.reservation_ttl.is_zero() {
            return Err(NodeError::invalid_config("relay.reservation_ttl must be > 0"));
        }
        if self.relay.sweep_interval.is_zero() {
            return Err(NodeError::invalid_config("relay.sweep_interval must be > 0"));
        }
        if self.relay.request_timeout.is_zero() {
            return Err(NodeError::invalid_config("relay.request_timeout must be > 0"));
        }
        if self.discovery_enabled {
            if self.discovery.topic.is_empty() {
                return Err(NodeError::invalid_config("discovery.topic is empty"));
            }
            if self.discovery.refresh_interval.is_zero() {
                return Err(NodeError::invalid_config(
                    "discovery.refresh_interval must be > 0",
                ));
            }
            if self.discovery.cache_capacity == 0 {
                return Err(NodeError::invalid_config(
                    "discovery.cache_capacity must be > 0",
                ));
            }
            if self.discovery.cache_ttl.is_zero() {
                return Err(NodeError::invalid_config("discovery.cache_ttl must be > 0"));
            }
        }
        Ok(())
    }
}
