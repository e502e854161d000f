//! The node's own advertised addresses.
//!
//! [`AddressRegistry`] is an ordered, duplicate-free list of multiaddrs. Order
//! is advertisement priority. Every effective mutation bumps a version
//! counter published on a `watch` channel; no-op mutations leave it alone so
//! subscribers only wake for real changes.

use crate::{Multiaddr, MultiaddrExt, PeerId};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// Ordered set of the node's listen/announce addresses
#[derive(Clone)]
pub struct AddressRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    addrs: RwLock<Vec<Multiaddr>>,
    version: watch::Sender<u64>,
}

impl AddressRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                addrs: RwLock::new(Vec::new()),
                version,
            }),
        }
    }

    /// Mutate the list under the write lock and bump the version if `f`
    /// reports a change
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Multiaddr>) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut addrs = self
                .inner
                .addrs
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut addrs)
        };
        if changed {
            self.inner.version.send_modify(|v| *v += 1);
        }
        result
    }

    /// Append `addr` if it is not already present
    ///
    /// Returns whether the registry changed.
    pub fn add(&self, addr: Multiaddr) -> bool {
        self.mutate(|addrs| {
            if addrs.contains(&addr) {
                (false, false)
            } else {
                addrs.push(addr);
                (true, true)
            }
        })
    }

    /// Append every address not already present, preserving order
    ///
    /// Returns the number of addresses added.
    pub fn extend<I: IntoIterator<Item = Multiaddr>>(&self, iter: I) -> usize {
        self.mutate(|addrs| {
            let mut added = 0;
            for addr in iter {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                    added += 1;
                }
            }
            (added, added > 0)
        })
    }

    /// Remove `addr`, returning whether it was present
    pub fn remove(&self, addr: &Multiaddr) -> bool {
        self.mutate(|addrs| match addrs.iter().position(|a| a == addr) {
            Some(index) => {
                addrs.remove(index);
                (true, true)
            }
            None => (false, false),
        })
    }

    /// Replace the whole list, dropping duplicates from `new`
    pub fn replace<I: IntoIterator<Item = Multiaddr>>(&self, new: I) {
        let mut deduped: Vec<Multiaddr> = Vec::new();
        for addr in new {
            if !deduped.contains(&addr) {
                deduped.push(addr);
            }
        }
        self.mutate(|addrs| {
            if *addrs == deduped {
                ((), false)
            } else {
                *addrs = deduped;
                ((), true)
            }
        });
    }

    /// Current addresses in advertisement order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Multiaddr> {
        self.inner
            .addrs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Current addresses suffixed with `/p2p/<peer>`
    #[must_use]
    pub fn with_peer(&self, peer: PeerId) -> Vec<Multiaddr> {
        self.snapshot()
            .into_iter()
            .map(|addr| addr.with_peer(peer))
            .collect()
    }

    /// Whether `addr` is registered
    #[must_use]
    pub fn contains(&self, addr: &Multiaddr) -> bool {
        self.inner
            .addrs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(addr)
    }

    /// Number of registered addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .addrs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no addresses are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current version; bumped on every effective mutation
    #[must_use]
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Subscribe to version changes
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AddressRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressRegistry")
            .field("addrs", &self.snapshot())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn test_add_preserves_order_and_rejects_duplicates() {
        let registry = AddressRegistry::new();
        assert!(registry.add(addr(2)));
        assert!(registry.add(addr(1)));
        assert!(!registry.add(addr(2)));
        assert_eq!(registry.snapshot(), vec![addr(2), addr(1)]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_version_bumps_only_on_change() {
        let registry = AddressRegistry::new();
        assert_eq!(registry.version(), 0);

        registry.add(addr(1));
        assert_eq!(registry.version(), 1);

        registry.add(addr(1));
        assert!(!registry.remove(&addr(9)));
        registry.replace(vec![addr(1)]);
        assert_eq!(registry.version(), 1);

        assert_eq!(registry.extend(vec![addr(1), addr(2), addr(3)]), 2);
        assert_eq!(registry.version(), 2);

        assert!(registry.remove(&addr(2)));
        assert_eq!(registry.version(), 3);
    }

    #[test]
    fn test_replace_dedups() {
        let registry = AddressRegistry::new();
        registry.add(addr(1));
        registry.replace(vec![addr(5), addr(6), addr(5)]);
        assert_eq!(registry.snapshot(), vec![addr(5), addr(6)]);
        assert!(!registry.contains(&addr(1)));
    }

    #[test]
    fn test_with_peer() {
        let registry = AddressRegistry::new();
        registry.add(addr(1));
        let peer = PeerId::from_bytes([4u8; 32]);
        let full = registry.with_peer(peer);
        assert_eq!(full[0].peer_id(), Some(peer));
        assert_eq!(registry.snapshot()[0].peer_id(), None);
    }

    #[tokio::test]
    async fn test_changes_notifies_subscriber() {
        let registry = AddressRegistry::new();
        let mut rx = registry.changes();

        let writer = registry.clone();
        tokio::spawn(async move {
            writer.add(addr(7));
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(registry.contains(&addr(7)));
    }
}
