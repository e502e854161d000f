//! Error types for address discovery.

use lantern_crypto::CryptoError;
use lantern_transport::TransportError;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The address registry is empty, so there is nothing to announce
    #[error("No addresses to announce")]
    NoAddresses,

    /// Encoding or decoding an announcement or gossip frame failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Signature creation or verification failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The topic has been shut down
    #[error("Topic closed")]
    TopicClosed,
}

impl From<bincode::Error> for DiscoveryError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
