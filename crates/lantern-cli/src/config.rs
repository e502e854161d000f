//! Configuration file for the Lantern CLI.

use lantern_crypto::PeerId;
use lantern_discovery::DiscoveryConfig as DiscoverySettings;
use lantern_node::NodeConfig;
use lantern_relay::RelayConfig;
use lantern_transport::Multiaddr;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lantern configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeSection,
    /// Listeners and neighbours
    #[serde(default)]
    pub network: NetworkConfig,
    /// Relay limits
    #[serde(default)]
    pub relay: RelaySection,
    /// Discovery topic
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Identity key file (hex seed, created on first run)
    #[serde(default = "default_identity_path")]
    pub identity_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multiaddrs to bind
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Externally visible multiaddrs to advertise instead
    #[serde(default)]
    pub announce: Vec<String>,
    /// Gossip neighbours as `<peer-id>@<multiaddr>`
    #[serde(default)]
    pub neighbours: Vec<String>,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Maximum concurrent reservations
    pub max_reservations: usize,
    /// Reservation lifetime in seconds
    pub reservation_ttl_secs: u64,
    /// Maximum concurrent circuits
    pub max_circuits: usize,
    /// Maximum concurrent circuits per source peer
    pub max_circuits_per_peer: usize,
    /// Bytes per circuit (0 = unlimited)
    pub circuit_data_limit: u64,
    /// Circuit lifetime in seconds (0 = unlimited)
    pub circuit_duration_secs: u64,
    /// Reservation sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Request read timeout in seconds
    pub request_timeout_secs: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Join the discovery topic
    pub enabled: bool,
    /// Topic name
    pub topic: String,
    /// Heartbeat republish interval in seconds
    pub refresh_interval_secs: u64,
    /// Peers remembered
    pub cache_capacity: usize,
    /// Age in seconds after which a remembered announcement is dropped
    pub cache_ttl_secs: u64,
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds in-flight circuits get to finish
    pub grace_period_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_identity_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".lantern/identity.key")
}

fn default_listen() -> Vec<String> {
    vec![format!("/ip4/0.0.0.0/tcp/{}", lantern_node::DEFAULT_PORT)]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity_file: default_identity_path(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            announce: Vec::new(),
            neighbours: Vec::new(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            reservation_ttl_secs: 3600,
            max_circuits: 256,
            max_circuits_per_peer: 8,
            circuit_data_limit: 128 * 1024,
            circuit_duration_secs: 120,
            sweep_interval_secs: 60,
            request_timeout_secs: 10,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: lantern_discovery::DEFAULT_TOPIC.to_string(),
            refresh_interval_secs: 10,
            cache_capacity: 1024,
            cache_ttl_secs: 300,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A gossip neighbour and where to dial it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    /// Neighbour's peer id
    pub peer: PeerId,
    /// Dialable address
    pub addr: Multiaddr,
}

impl std::str::FromStr for Neighbour {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("Neighbour {s:?} is not <peer-id>@<multiaddr>"))?;
        let peer: PeerId = peer
            .parse()
            .map_err(|e| anyhow::anyhow!("Neighbour {s:?}: {e}"))?;
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Neighbour {s:?}: {e}"))?;
        Ok(Self { peer, addr })
    }
}

fn parse_addrs(list: &[String], name: &str) -> anyhow::Result<Vec<Multiaddr>> {
    list.iter()
        .map(|s| {
            s.parse::<Multiaddr>()
                .map_err(|e| anyhow::anyhow!("Invalid {name} address {s:?}: {e}"))
        })
        .collect()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lantern/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parsed listen addresses
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unparsable address.
    pub fn listen_addrs(&self) -> anyhow::Result<Vec<Multiaddr>> {
        parse_addrs(&self.network.listen, "listen")
    }

    /// Parsed announce addresses
    ///
    /// # Errors
    ///
    /// Returns an error naming the first unparsable address.
    pub fn announce_addrs(&self) -> anyhow::Result<Vec<Multiaddr>> {
        parse_addrs(&self.network.announce, "announce")
    }

    /// Parsed gossip neighbours
    ///
    /// # Errors
    ///
    /// Returns an error naming the first malformed entry.
    pub fn neighbours(&self) -> anyhow::Result<Vec<Neighbour>> {
        self.network.neighbours.iter().map(|s| s.parse()).collect()
    }

    /// Build the node configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any address does not parse.
    pub fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let relay = &self.relay;
        let discovery = &self.discovery;

        Ok(NodeConfig {
            listen: self.listen_addrs()?,
            announce: self.announce_addrs()?,
            neighbours: self.neighbours()?.into_iter().map(|n| n.peer).collect(),
            relay: RelayConfig {
                max_reservations: relay.max_reservations,
                reservation_ttl: Duration::from_secs(relay.reservation_ttl_secs),
                max_circuits: relay.max_circuits,
                max_circuits_per_peer: relay.max_circuits_per_peer,
                // 0 = unlimited
                circuit_data_limit: (relay.circuit_data_limit > 0)
                    .then_some(relay.circuit_data_limit),
                circuit_duration_limit: (relay.circuit_duration_secs > 0)
                    .then(|| Duration::from_secs(relay.circuit_duration_secs)),
                sweep_interval: Duration::from_secs(relay.sweep_interval_secs),
                request_timeout: Duration::from_secs(relay.request_timeout_secs),
                ..RelayConfig::default()
            },
            discovery_enabled: discovery.enabled,
            discovery: DiscoverySettings {
                topic: discovery.topic.clone(),
                refresh_interval: Duration::from_secs(discovery.refresh_interval_secs),
                cache_capacity: discovery.cache_capacity,
                cache_ttl: Duration::from_secs(discovery.cache_ttl_secs),
                ..DiscoverySettings::default()
            },
            shutdown_grace: Duration::from_secs(self.shutdown.grace_period_secs),
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.to_node_config()?.validate()?;
        Ok(())
    }
}
