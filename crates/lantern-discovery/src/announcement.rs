//! Signed address announcements.
//!
//! An announcement binds a peer's current address list to a sequence number
//! under the peer's own Ed25519 key. Receivers verify the signature against
//! the announced [`PeerId`] before trusting anything in it, and keep only the
//! highest sequence seen per peer.

use crate::error::DiscoveryResult;
use lantern_crypto::{CryptoError, Identity, PeerId, Signature};
use lantern_transport::Multiaddr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Domain separation tag mixed into every announcement signature
const ANNOUNCEMENT_DOMAIN: &str = "lantern-discovery-announcement-v1";

/// A peer's signed list of reachable addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Announcing peer
    pub peer: PeerId,
    /// Addresses the peer can be reached at
    pub addrs: Vec<Multiaddr>,
    /// Monotonic per-peer sequence number
    pub sequence: u64,
    /// Ed25519 signature over the fields above
    pub signature: Vec<u8>,
}

impl Announcement {
    /// Sign a new announcement with `identity`
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Codec` if the signed payload cannot be
    /// encoded.
    pub fn sign(identity: &Identity, addrs: Vec<Multiaddr>, sequence: u64) -> DiscoveryResult<Self> {
        let peer = identity.peer_id();
        let payload = signing_bytes(&peer, &addrs, sequence)?;
        let signature = identity.sign(&payload).to_vec();
        Ok(Self {
            peer,
            addrs,
            sequence,
            signature,
        })
    }

    /// Check the signature against the announced peer
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidSignature` if the signature is malformed
    /// or does not match, or `CryptoError::InvalidPeerId` if the payload
    /// cannot be re-encoded.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let payload = signing_bytes(&self.peer, &self.addrs, self.sequence)
            .map_err(|e| CryptoError::InvalidPeerId(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)?;
        lantern_crypto::verify(&self.peer, &payload, &signature)
    }

    /// Whether the address list names the same address twice
    #[must_use]
    pub fn has_duplicate_addrs(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.addrs.len());
        !self.addrs.iter().all(|addr| seen.insert(addr))
    }

    /// Encode for publication on a topic
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Codec` if serialization fails.
    pub fn encode(&self) -> DiscoveryResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a received payload. The signature is not checked.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Codec` if `bytes` is not an announcement.
    pub fn decode(bytes: &[u8]) -> DiscoveryResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn signing_bytes(peer: &PeerId, addrs: &[Multiaddr], sequence: u64) -> DiscoveryResult<Vec<u8>> {
    Ok(bincode::serialize(&(ANNOUNCEMENT_DOMAIN, peer, addrs, sequence))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<Multiaddr> {
        vec![
            "/ip4/127.0.0.1/tcp/9095".parse().unwrap(),
            "/ip4/10.0.0.2/tcp/9095".parse().unwrap(),
        ]
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let announcement = Announcement::sign(&identity, addrs(), 7).unwrap();
        assert_eq!(announcement.peer, identity.peer_id());
        assert!(announcement.verify().is_ok());
    }

    #[test]
    fn test_tampered_fields_fail_verification() {
        let identity = Identity::generate();
        let announcement = Announcement::sign(&identity, addrs(), 7).unwrap();

        let mut bumped = announcement.clone();
        bumped.sequence = 8;
        assert!(bumped.verify().is_err());

        let mut rerouted = announcement.clone();
        rerouted.addrs.push("/ip4/6.6.6.6/tcp/1".parse().unwrap());
        assert!(rerouted.verify().is_err());

        let mut stolen = announcement;
        stolen.peer = Identity::generate().peer_id();
        assert!(stolen.verify().is_err());
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let identity = Identity::generate();
        let mut announcement = Announcement::sign(&identity, addrs(), 1).unwrap();
        announcement.signature.truncate(10);
        assert!(announcement.verify().is_err());
    }

    #[test]
    fn test_encode_decode() {
        let identity = Identity::generate();
        let announcement = Announcement::sign(&identity, addrs(), 42).unwrap();
        let decoded = Announcement::decode(&announcement.encode().unwrap()).unwrap();
        assert_eq!(decoded, announcement);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Announcement::decode(&[0xff; 5]).is_err());
    }

    #[test]
    fn test_duplicate_addrs() {
        let identity = Identity::generate();
        let mut list = addrs();
        let clean = Announcement::sign(&identity, list.clone(), 1).unwrap();
        assert!(!clean.has_duplicate_addrs());

        list.push(list[0].clone());
        let dup = Announcement::sign(&identity, list, 1).unwrap();
        assert!(dup.has_duplicate_addrs());
    }
}
