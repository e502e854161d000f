//! Discovery publisher.
//!
//! The publisher announces the node's [`AddressRegistry`] on a gossip topic
//! and keeps the freshest verified announcement it has received from every
//! other peer. Publishing happens on a fixed heartbeat and whenever the
//! registry changes.
//!
//! Sequence numbers are Unix milliseconds. An announcement older than
//! `cache_ttl + max_clock_skew` is refused outright, and the highest sequence
//! accepted from each peer is kept until that window covers it, so evicting
//! a cache entry never reopens the door to a replay.

use crate::announcement::Announcement;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::topic::Topic;
use dashmap::DashMap;
use lantern_crypto::{Identity, PeerId};
use lantern_transport::AddressRegistry;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Topic browsers and relays meet on
pub const DEFAULT_TOPIC: &str = "browser-peer-discovery";

/// Queue depth for [`DiscoveryPublisher::subscribe_announcements`]
const ANNOUNCEMENT_QUEUE: usize = 64;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Gossip topic name
    pub topic: String,
    /// Heartbeat between unconditional republishes
    pub refresh_interval: Duration,
    /// Maximum number of peers remembered
    pub cache_capacity: usize,
    /// Age after which a remembered announcement is dropped
    pub cache_ttl: Duration,
    /// Tolerated clock difference between announcer and receiver
    pub max_clock_skew: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            refresh_interval: Duration::from_secs(10),
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(300),
            max_clock_skew: Duration::from_secs(30),
        }
    }
}

/// Why a received announcement was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Payload did not decode, or named no addresses
    Malformed,
    /// Signature did not verify against the announced peer
    BadSignature,
    /// Sequence not newer than the one already held
    Stale,
    /// Sequence older than the freshness window
    Expired,
    /// Our own announcement came back
    OwnAnnouncement,
    /// Same address listed more than once
    DuplicateAddresses,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Malformed => "malformed",
            Self::BadSignature => "bad signature",
            Self::Stale => "stale",
            Self::Expired => "expired",
            Self::OwnAnnouncement => "own announcement",
            Self::DuplicateAddresses => "duplicate addresses",
        };
        f.write_str(s)
    }
}

/// Outcome of processing one received payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Stored as the newest announcement for its peer
    Accepted(Announcement),
    /// Dropped without changing any state
    Discarded(DiscardReason),
}

impl Ingest {
    /// Whether the payload was accepted
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

struct CachedAnnouncement {
    announcement: Announcement,
    received_at: Instant,
}

struct Membership {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Publishes our addresses and collects everyone else's
#[derive(Clone)]
pub struct DiscoveryPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    identity: Arc<Identity>,
    topic: Arc<dyn Topic>,
    registry: AddressRegistry,
    config: DiscoveryConfig,
    last_sequence: Mutex<u64>,
    cache: Mutex<LruCache<PeerId, CachedAnnouncement>>,
    /// Highest accepted sequence per peer; outlives cache eviction
    high_water: DashMap<PeerId, u64>,
    membership: Mutex<Option<Membership>>,
    announcements: broadcast::Sender<Announcement>,
}

impl DiscoveryPublisher {
    /// Create a publisher announcing `registry` on `topic`
    #[must_use]
    pub fn new(
        identity: Arc<Identity>,
        topic: Arc<dyn Topic>,
        registry: AddressRegistry,
        config: DiscoveryConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_QUEUE);
        Self {
            inner: Arc::new(PublisherInner {
                identity,
                topic,
                registry,
                config,
                last_sequence: Mutex::new(0),
                cache: Mutex::new(LruCache::new(capacity)),
                high_water: DashMap::new(),
                membership: Mutex::new(None),
                announcements,
            }),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// Local peer id
    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    // ------------------------------------------------------------------
    // Topic membership
    // ------------------------------------------------------------------

    /// Subscribe to the topic and start ingesting announcements
    ///
    /// Joining twice keeps the existing subscription.
    ///
    /// # Returns
    /// `true` if a new subscription was created.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::TopicClosed` if the topic refuses the
    /// subscription.
    pub fn join(&self) -> DiscoveryResult<bool> {
        let mut membership = self
            .inner
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if membership.as_ref().is_some_and(|m| !m.task.is_finished()) {
            return Ok(false);
        }

        let mut subscription = self.inner.topic.subscribe()?;
        let cancel = CancellationToken::new();
        let this = self.clone();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    message = subscription.next() => match message {
                        Some(message) => {
                            this.on_message(&message.data);
                        }
                        None => break,
                    },
                }
            }
        });

        *membership = Some(Membership { cancel, task });
        tracing::info!("Joined discovery topic {}", self.inner.topic.name());
        Ok(true)
    }

    /// Unsubscribe from the topic. A no-op if not joined.
    pub async fn leave(&self) {
        let membership = self
            .inner
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Membership { cancel, task }) = membership {
            cancel.cancel();
            let _ = task.await;
            tracing::info!("Left discovery topic {}", self.inner.topic.name());
        }
    }

    /// Whether a subscription is active
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.inner
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|m| !m.task.is_finished())
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Sign and publish the current registry contents
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NoAddresses` if the registry is empty, or the
    /// topic's error if publication fails.
    pub async fn publish(&self) -> DiscoveryResult<Announcement> {
        let addrs = self.inner.registry.snapshot();
        if addrs.is_empty() {
            return Err(DiscoveryError::NoAddresses);
        }

        let sequence = self.next_sequence();
        let announcement = Announcement::sign(&self.inner.identity, addrs, sequence)?;
        self.inner.topic.publish(announcement.encode()?).await?;

        tracing::debug!(
            "Announced {} addresses on {} (seq {})",
            announcement.addrs.len(),
            self.inner.topic.name(),
            sequence
        );
        Ok(announcement)
    }

    /// Strictly increasing, and tracks wall-clock milliseconds so a
    /// restarted node supersedes its previous announcements
    fn next_sequence(&self) -> u64 {
        let now_ms = unix_ms();
        let mut last = self
            .inner
            .last_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = now_ms.max(last.saturating_add(1));
        *last
    }

    async fn publish_logged(&self, trigger: &str) {
        match self.publish().await {
            Ok(_) => {}
            Err(DiscoveryError::NoAddresses) => {
                tracing::trace!("Skipping {} announcement: no addresses", trigger);
            }
            Err(e) => tracing::warn!("Failed to publish {} announcement: {}", trigger, e),
        }
    }

    /// Publish on every heartbeat and registry change until `cancel` fires
    ///
    /// The first heartbeat is one full interval away; callers publish the
    /// initial announcement themselves.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut changes = self.inner.registry.changes();
        changes.borrow_and_update();

        let period = self.inner.config.refresh_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    self.evict_stale();
                    self.publish_logged("heartbeat").await;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.publish_logged("address change").await;
                }
            }
        }
        tracing::debug!("Discovery publisher stopped");
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Process one payload received on the topic
    ///
    /// The payload is decoded and its signature verified before any state
    /// is touched. Only an announcement with a strictly higher sequence than
    /// the one held for its peer replaces it.
    pub fn on_message(&self, raw: &[u8]) -> Ingest {
        let outcome = self.ingest(raw);
        match &outcome {
            Ingest::Accepted(a) => {
                tracing::debug!(
                    "Accepted announcement from {} (seq {}, {} addresses)",
                    a.peer.short(),
                    a.sequence,
                    a.addrs.len()
                );
                let _ = self.inner.announcements.send(a.clone());
            }
            Ingest::Discarded(reason) => {
                tracing::trace!("Discarded announcement: {}", reason);
            }
        }
        outcome
    }

    fn ingest(&self, raw: &[u8]) -> Ingest {
        let Ok(announcement) = Announcement::decode(raw) else {
            return Ingest::Discarded(DiscardReason::Malformed);
        };
        if announcement.addrs.is_empty() {
            return Ingest::Discarded(DiscardReason::Malformed);
        }
        if announcement.peer == self.local_peer() {
            return Ingest::Discarded(DiscardReason::OwnAnnouncement);
        }
        if announcement.has_duplicate_addrs() {
            return Ingest::Discarded(DiscardReason::DuplicateAddresses);
        }
        if announcement.verify().is_err() {
            return Ingest::Discarded(DiscardReason::BadSignature);
        }
        if announcement.sequence < self.freshness_floor() {
            return Ingest::Discarded(DiscardReason::Expired);
        }

        let mut cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let held = self
            .inner
            .high_water
            .get(&announcement.peer)
            .map(|seq| *seq)
            .or_else(|| cache.peek(&announcement.peer).map(|e| e.announcement.sequence));
        if held.is_some_and(|seq| seq >= announcement.sequence) {
            return Ingest::Discarded(DiscardReason::Stale);
        }
        self.inner
            .high_water
            .insert(announcement.peer, announcement.sequence);
        cache.put(
            announcement.peer,
            CachedAnnouncement {
                announcement: announcement.clone(),
                received_at: Instant::now(),
            },
        );
        Ingest::Accepted(announcement)
    }

    /// Oldest sequence still inside the freshness window
    fn freshness_floor(&self) -> u64 {
        let window = self.inner.config.cache_ttl + self.inner.config.max_clock_skew;
        unix_ms().saturating_sub(u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
    }

    /// Receive every announcement accepted from now on
    #[must_use]
    pub fn subscribe_announcements(&self) -> broadcast::Receiver<Announcement> {
        self.inner.announcements.subscribe()
    }

    /// Drop announcements older than the cache TTL
    ///
    /// Sequence high-water marks are only dropped once the freshness window
    /// has moved past them.
    ///
    /// # Returns
    /// Number of peers forgotten.
    pub fn evict_stale(&self) -> usize {
        let ttl = self.inner.config.cache_ttl;
        let now = Instant::now();
        let mut cache = self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner);

        let floor = self.freshness_floor();
        self.inner.high_water.retain(|_, seq| *seq >= floor);

        let stale: Vec<PeerId> = cache
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.received_at) > ttl)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &stale {
            cache.pop(peer);
        }
        if !stale.is_empty() {
            tracing::debug!("Evicted {} stale announcements", stale.len());
        }
        stale.len()
    }

    /// Newest announcement held for `peer`
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Announcement> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(peer)
            .map(|entry| entry.announcement.clone())
    }

    /// Peers with a held announcement, most recently updated first
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Number of peers with a held announcement
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no announcements are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wall-clock milliseconds since the Unix epoch
fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl fmt::Debug for DiscoveryPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryPublisher")
            .field("peer", &self.local_peer())
            .field("topic", &self.inner.topic.name())
            .field("known_peers", &self.len())
            .finish_non_exhaustive()
    }
}
