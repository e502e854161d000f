//! Peer identifiers.
//!
//! A [`PeerId`] is the peer's Ed25519 verifying key. Keeping the key itself
//! (rather than a hash of it) lets any receiver check a signature from the
//! identifier alone, with no key lookup.

use crate::CryptoError;
use crate::PUBLIC_KEY_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable peer identifier derived from a peer's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PUBLIC_KEY_SIZE]);

impl PeerId {
    /// Wrap raw public key bytes
    ///
    /// No curve check happens here; [`crate::verify`] rejects identifiers
    /// that are not valid points.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Abbreviated form for log lines (first 8 bytes, hex)
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Convert into an Ed25519 verifying key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a valid
    /// curve point.
    pub fn verifying_key(&self) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidPeerId(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl From<ed25519_dalek::VerifyingKey> for PeerId {
    fn from(key: ed25519_dalek::VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}
