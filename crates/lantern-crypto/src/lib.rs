//! # Lantern Crypto
//!
//! Identity primitives for the Lantern relay node.
//!
//! This crate provides:
//! - [`PeerId`]: the stable 32-byte peer identifier (an Ed25519 public key)
//! - [`Identity`]: a long-term Ed25519 signing key, persisted as a key file
//! - [`Signature`] and [`verify`]: detached signatures checked against a `PeerId`
//!
//! ## Example
//!
//! ```
//! use lantern_crypto::{Identity, verify};
//!
//! let identity = Identity::generate();
//! let signature = identity.sign(b"announce");
//! assert!(verify(&identity.peer_id(), b"announce", &signature).is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identity;
pub mod peer_id;
pub mod signatures;

pub use error::CryptoError;
pub use identity::Identity;
pub use peer_id::PeerId;
pub use signatures::{Signature, verify};

/// Ed25519 public key size (also the `PeerId` size)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;
