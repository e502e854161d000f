//! Reservation table.
//!
//! A reservation lets a peer receive relayed circuits through this node
//! until it expires. The table is bounded: once `capacity` live reservations
//! exist, new peers are rejected (never queued). Repeated requests from a
//! peer that already holds a reservation are idempotent and return the
//! stored entry; a repeat that arrives after more than half the TTL has
//! passed pushes the expiry out again.
//!
//! Expired entries are invisible to lookups and removed lazily on access, by
//! the background sweeper, or by a sweep triggered when the table is full.
//! Every operation has an `*_at` variant taking an explicit [`Instant`] so
//! tests can drive time directly.

use crate::error::ReservationError;
use crate::protocol::CircuitLimits;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lantern_transport::PeerId;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A peer's right to receive relayed circuits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Reserved peer
    pub peer: PeerId,
    /// When the reservation was first granted
    pub created_at: Instant,
    /// When it stops being valid
    pub expires_at: Instant,
    /// Limits applied to circuits towards this peer
    pub limits: CircuitLimits,
}

impl Reservation {
    fn new(peer: PeerId, now: Instant, ttl: Duration, limits: CircuitLimits) -> Self {
        Self {
            peer,
            created_at: now,
            expires_at: now + ttl,
            limits,
        }
    }

    /// Whether the reservation has lapsed at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, zero once expired
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Expiry as Unix seconds, for the wire
    #[must_use]
    pub fn expires_at_unix(&self) -> u64 {
        let remaining = self.remaining_at(Instant::now());
        (SystemTime::now() + remaining)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Bounded, expiring set of reservations keyed by peer
pub struct ReservationTable {
    entries: DashMap<PeerId, Reservation>,
    /// Number of entries, including expired-but-unswept ones
    count: AtomicUsize,
    capacity: usize,
    ttl: Duration,
    limits: CircuitLimits,
}

impl ReservationTable {
    /// Create a table holding at most `capacity` reservations of `ttl` each
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration, limits: CircuitLimits) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            capacity,
            ttl,
            limits,
        }
    }

    /// Grant or refresh a reservation for `peer`
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::AtCapacity`] if the table is full of live
    /// reservations.
    pub fn reserve(&self, peer: PeerId) -> Result<Reservation, ReservationError> {
        self.reserve_at(peer, Instant::now())
    }

    /// [`reserve`](Self::reserve) at an explicit time
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::AtCapacity`] if the table is full of live
    /// reservations.
    pub fn reserve_at(&self, peer: PeerId, now: Instant) -> Result<Reservation, ReservationError> {
        let mut swept = false;
        loop {
            match self.entries.entry(peer) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    if existing.is_expired_at(now) {
                        *existing = Reservation::new(peer, now, self.ttl, self.limits);
                    } else if existing.remaining_at(now) < self.ttl / 2 {
                        existing.expires_at = now + self.ttl;
                        tracing::trace!("Renewed reservation for {}", peer.short());
                    }
                    return Ok(existing.clone());
                }
                Entry::Vacant(entry) => {
                    if self.try_acquire_slot() {
                        let reservation = Reservation::new(peer, now, self.ttl, self.limits);
                        entry.insert(reservation.clone());
                        return Ok(reservation);
                    }
                    // Release the shard lock before sweeping
                    drop(entry);
                    if swept {
                        return Err(ReservationError::AtCapacity {
                            capacity: self.capacity,
                        });
                    }
                    swept = true;
                    let removed = self.sweep_at(now);
                    tracing::debug!(
                        "Reservation table full, sweep removed {} expired entries",
                        removed
                    );
                }
            }
        }
    }

    fn try_acquire_slot(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slots(&self, n: usize) {
        if n > 0 {
            self.count.fetch_sub(n, Ordering::AcqRel);
        }
    }

    /// Whether `peer` holds a live reservation
    #[must_use]
    pub fn is_reserved(&self, peer: &PeerId) -> bool {
        self.is_reserved_at(peer, Instant::now())
    }

    /// [`is_reserved`](Self::is_reserved) at an explicit time
    #[must_use]
    pub fn is_reserved_at(&self, peer: &PeerId, now: Instant) -> bool {
        self.get_at(peer, now).is_some()
    }

    /// The live reservation for `peer`, if any
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Reservation> {
        self.get_at(peer, Instant::now())
    }

    /// [`get`](Self::get) at an explicit time; evicts the entry if expired
    #[must_use]
    pub fn get_at(&self, peer: &PeerId, now: Instant) -> Option<Reservation> {
        let expired = match self.entries.get(peer) {
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired
            && self
                .entries
                .remove_if(peer, |_, r| r.is_expired_at(now))
                .is_some()
        {
            self.release_slots(1);
        }
        None
    }

    /// Remove the reservation for `peer` immediately
    pub fn revoke(&self, peer: &PeerId) -> Option<Reservation> {
        let removed = self.entries.remove(peer).map(|(_, r)| r);
        if removed.is_some() {
            self.release_slots(1);
        }
        removed
    }

    /// Remove every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at an explicit time
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, r| {
            let keep = !r.is_expired_at(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        self.release_slots(removed);
        removed
    }

    /// Sweep every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = table.sweep();
                        if removed > 0 {
                            tracing::debug!("Swept {} expired reservations", removed);
                        }
                    }
                }
            }
        })
    }

    /// Number of stored entries (expired ones count until swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured reservation lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Peers with live reservations
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| *entry.key())
            .collect()
    }
}

impl std::fmt::Debug for ReservationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}
