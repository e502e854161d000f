//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature did not verify, or was malformed
    #[error("invalid signature")]
    InvalidSignature,

    /// Bytes do not encode a valid Ed25519 public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Peer identifier could not be parsed
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Identity key file is unreadable or corrupt
    #[error("invalid key file: {0}")]
    KeyFile(String),

    /// I/O error while loading or storing key material
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
