//! Transport layer errors.

use lantern_crypto::PeerId;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// This transport cannot handle the address
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No address or link is known for the peer
    #[error("Peer unreachable: {}", .0.short())]
    PeerUnreachable(PeerId),

    /// Handshake rejected or malformed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// Frame exceeds the negotiated maximum
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Maximum accepted length
        max: usize,
    },

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether the error came from decoding the peer's bytes, as opposed to
    /// the stream itself failing
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TransportError::Codec(_) | TransportError::FrameTooLarge { .. }
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
