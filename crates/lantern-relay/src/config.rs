//! Relay configuration.

use crate::circuit::ForwarderConfig;
use crate::protocol::CircuitLimits;
use std::time::Duration;

/// Relay service configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum concurrent reservations
    pub max_reservations: usize,
    /// Lifetime of a reservation
    pub reservation_ttl: Duration,
    /// Maximum concurrent circuits on this node
    pub max_circuits: usize,
    /// Maximum concurrent circuits opened by one source peer
    pub max_circuits_per_peer: usize,
    /// Bytes each circuit may relay (`None` = unlimited)
    pub circuit_data_limit: Option<u64>,
    /// Lifetime of each circuit (`None` = unlimited)
    pub circuit_duration_limit: Option<Duration>,
    /// Interval of the background reservation sweep
    pub sweep_interval: Duration,
    /// Time allowed to read a request or reach the destination
    pub request_timeout: Duration,
    /// Time allowed to shut down a circuit's write sides
    pub teardown_timeout: Duration,
    /// Copy buffer per circuit direction
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            reservation_ttl: Duration::from_secs(3600),
            max_circuits: 256,
            max_circuits_per_peer: 8,
            circuit_data_limit: Some(128 * 1024),
            circuit_duration_limit: Some(Duration::from_secs(120)),
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(2),
            buffer_size: 16 * 1024,
        }
    }
}

impl RelayConfig {
    /// Limits granted with each reservation
    #[must_use]
    pub fn limits(&self) -> CircuitLimits {
        CircuitLimits {
            data_limit: self.circuit_data_limit,
            duration_limit: self.circuit_duration_limit,
        }
    }

    /// Forwarder settings derived from this configuration
    #[must_use]
    pub fn forwarder(&self) -> ForwarderConfig {
        ForwarderConfig {
            max_circuits: self.max_circuits,
            max_circuits_per_peer: self.max_circuits_per_peer,
            buffer_size: self.buffer_size,
            teardown_timeout: self.teardown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.max_reservations, 128);
        assert_eq!(config.reservation_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_circuits, 256);
        assert_eq!(config.max_circuits_per_peer, 8);
        assert_eq!(config.limits().data_limit, Some(131_072));
        assert_eq!(config.limits().duration_limit, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_forwarder_config_follows_relay_config() {
        let config = RelayConfig {
            max_circuits: 3,
            max_circuits_per_peer: 1,
            ..RelayConfig::default()
        };
        let forwarder = config.forwarder();
        assert_eq!(forwarder.max_circuits, 3);
        assert_eq!(forwarder.max_circuits_per_peer, 1);
    }
}
