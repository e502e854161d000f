//! Long-term node identity.
//!
//! An [`Identity`] wraps the node's Ed25519 signing key. The [`PeerId`] is
//! derived from the public half, so a node that reloads the same key file
//! keeps the same identifier across restarts.
//!
//! # Key file format
//!
//! The key file holds the 32-byte Ed25519 seed as 64 hex characters followed
//! by a newline. On Unix the file is created with mode `0600`.
//!
//! ```no_run
//! use lantern_crypto::Identity;
//!
//! let identity = Identity::load_or_generate("identity.key").expect("key file");
//! println!("PeerID: {}", identity.peer_id());
//! ```

use crate::{CryptoError, PeerId, Signature};
use ed25519_dalek::Signer;
use rand_core::OsRng;
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// Node identity holding the Ed25519 signing key
///
/// Zeroized on drop so the secret does not linger in memory.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    key: ed25519_dalek::SigningKey,
}

impl Identity {
    /// Generate a fresh random identity
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Create an identity from a 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The stable identifier derived from this identity's public key
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.key.verifying_key())
    }

    /// Sign a message
    ///
    /// Ed25519 signing is deterministic: the same message always yields the
    /// same signature under the same key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.key.sign(message).to_bytes())
    }

    /// Load the identity stored at `path`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the file cannot be read and
    /// [`CryptoError::KeyFile`] if its contents are not a hex-encoded seed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let contents = Zeroizing::new(fs::read_to_string(path.as_ref())?);
        let decoded = Zeroizing::new(
            hex::decode(contents.trim()).map_err(|e| CryptoError::KeyFile(e.to_string()))?,
        );
        let seed: Zeroizing<[u8; 32]> =
            Zeroizing::new(decoded.as_slice().try_into().map_err(|_| {
                CryptoError::KeyFile(format!("expected 32-byte seed, got {} bytes", decoded.len()))
            })?);
        Ok(Self::from_seed(&seed))
    }

    /// Write the identity to `path`, creating parent directories as needed
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CryptoError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let encoded = Zeroizing::new(format!("{}\n", hex::encode(self.key.to_bytes())));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(encoded.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Load the identity at `path`, generating and saving a new one if the
    /// file does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is corrupt or the new key cannot
    /// be written.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = Identity::from_seed(&[7u8; 32]);
        let b = Identity::from_seed(&[7u8; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "not hex").unwrap();
        assert!(matches!(Identity::load(&path), Err(CryptoError::KeyFile(_))));

        fs::write(&path, "abcd").unwrap();
        assert!(matches!(Identity::load(&path), Err(CryptoError::KeyFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        Identity::generate().save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = Identity::from_seed(&[1u8; 32]);
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("peer_id"));
        assert!(!rendered.contains(&hex::encode([1u8; 32])));
    }
}
