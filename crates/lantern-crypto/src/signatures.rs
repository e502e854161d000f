//! Ed25519 detached signatures.
//!
//! Signatures are produced by [`crate::Identity::sign`] and checked with
//! [`verify`] against the signer's [`PeerId`]. Verification uses the strict
//! variant so that malleated signatures and small-order keys are rejected.

use crate::{CryptoError, PeerId, SIGNATURE_SIZE};

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Copy into an owned buffer (wire encodings carry signatures as byte strings)
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// Verify `signature` over `message` by the peer identified by `signer`
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if `signer` is not a valid key,
/// or [`CryptoError::InvalidSignature`] if the signature does not
/// authenticate the message.
pub fn verify(signer: &PeerId, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let key = signer.verifying_key()?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    if key.is_weak() {
        return Err(CryptoError::InvalidPublicKey);
    }
    key.verify_strict(message, &sig).map_err(|_| CryptoError::InvalidSignature)
}
