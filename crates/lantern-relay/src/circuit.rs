//! Circuit forwarder.
//!
//! A circuit splices two authenticated byte streams, one from the source
//! peer and one to the destination, and copies bytes in both directions
//! until they finish, one of them fails, a limit is hit or the circuit is
//! closed from outside.
//!
//! Opening happens in two steps. [`CircuitForwarder::admit`] claims node and
//! per-source-peer capacity atomically and returns an RAII [`CircuitPermit`];
//! [`CircuitForwarder::spawn`] then starts the copy loops. The relay service
//! admits before dialling the destination so that capacity is never
//! overshot by slow dials.
//!
//! Lifecycle of a circuit:
//!
//! ```text
//!   Active ──(one side EOF: FIN forwarded, other side keeps flowing)──► Active
//!   Active ──(both sides EOF)─────────────────────────────────────────► Closed
//!   Active ──(error, limit, close(), shutdown)──► Closing ──(teardown)► Closed
//! ```
//!
//! The data limit covers both directions together and is enforced before
//! each write, so a circuit never relays more than its budget.

use crate::error::{CapacityScope, CircuitError};
use crate::protocol::CircuitLimits;
use dashmap::DashMap;
use lantern_transport::{ByteStream, PeerId};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Circuit identifier, unique per forwarder
pub type CircuitId = u64;

/// Circuit lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Relaying bytes (possibly in one direction only after a half-close)
    Active = 0,
    /// Being torn down
    Closing = 1,
    /// Both streams released
    Closed = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Active,
            1 => CircuitState::Closing,
            _ => CircuitState::Closed,
        }
    }
}

/// Why a circuit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached EOF
    Finished,
    /// A stream failed mid-transfer
    StreamError,
    /// The data limit was reached
    DataLimit,
    /// The duration limit was reached
    DurationLimit,
    /// A peer's reservation was revoked
    Revoked,
    /// The node is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Finished => "finished",
            CloseReason::StreamError => "stream error",
            CloseReason::DataLimit => "data limit",
            CloseReason::DurationLimit => "duration limit",
            CloseReason::Revoked => "revoked",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum concurrent circuits
    pub max_circuits: usize,
    /// Maximum concurrent circuits per source peer
    pub max_circuits_per_peer: usize,
    /// Copy buffer per direction
    pub buffer_size: usize,
    /// Time allowed to shut down write sides on teardown
    pub teardown_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_circuits: 256,
            max_circuits_per_peer: 8,
            buffer_size: 16 * 1024,
            teardown_timeout: Duration::from_secs(2),
        }
    }
}

/// A live or finished relayed connection
pub struct Circuit {
    id: CircuitId,
    src: PeerId,
    dst: PeerId,
    opened_at: Instant,
    limits: CircuitLimits,
    bytes_relayed: AtomicU64,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Circuit {
    /// Circuit id
    #[must_use]
    pub fn id(&self) -> CircuitId {
        self.id
    }

    /// Peer that requested the circuit
    #[must_use]
    pub fn src(&self) -> PeerId {
        self.src
    }

    /// Reserved peer the circuit leads to
    #[must_use]
    pub fn dst(&self) -> PeerId {
        self.dst
    }

    /// Whether the circuit touches `peer` on either end
    #[must_use]
    pub fn involves(&self, peer: &PeerId) -> bool {
        self.src == *peer || self.dst == *peer
    }

    /// When the circuit was opened
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Limits governing the circuit
    #[must_use]
    pub fn limits(&self) -> CircuitLimits {
        self.limits
    }

    /// Bytes relayed so far, both directions
    #[must_use]
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Acquire)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reason the circuit ended (or is ending)
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Whether teardown has completed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Ask the circuit to close
    ///
    /// Returns `false` if it was already closing or closed. The first
    /// recorded reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        let _ = self.reason.set(reason);
        let was_active = self.begin_closing();
        self.cancel.cancel();
        was_active
    }

    /// Wait until teardown has completed
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                CircuitState::Active as u8,
                CircuitState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim up to `want` bytes of the data budget, returning the grant
    fn admit_bytes(&self, want: u64) -> u64 {
        let Some(limit) = self.limits.data_limit else {
            self.bytes_relayed.fetch_add(want, Ordering::AcqRel);
            return want;
        };

        let mut granted = 0;
        let _ = self
            .bytes_relayed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                granted = limit.saturating_sub(used).min(want);
                (granted > 0).then_some(used + granted)
            });
        granted
    }

    fn budget_exhausted(&self) -> bool {
        self.limits
            .data_limit
            .is_some_and(|limit| self.bytes_relayed() >= limit)
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("bytes_relayed", &self.bytes_relayed())
            .field("state", &self.state())
            .field("reason", &self.close_reason())
            .finish()
    }
}

/// Cumulative forwarder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Circuits opened
    pub opened: u64,
    /// Circuits closed
    pub closed: u64,
    /// Admissions rejected
    pub rejected: u64,
    /// Circuits currently live
    pub active: usize,
    /// Bytes relayed by all circuits, live and closed
    pub bytes_relayed: u64,
}

/// Claimed circuit capacity; released on drop
pub struct CircuitPermit {
    inner: Arc<ForwarderInner>,
    src: PeerId,
    dst: PeerId,
    limits: CircuitLimits,
}

impl CircuitPermit {
    /// Source peer
    #[must_use]
    pub fn src(&self) -> PeerId {
        self.src
    }

    /// Destination peer
    #[must_use]
    pub fn dst(&self) -> PeerId {
        self.dst
    }

    /// Limits the circuit will run under
    #[must_use]
    pub fn limits(&self) -> CircuitLimits {
        self.limits
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);

        let emptied = match self.inner.per_peer.get_mut(&self.src) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            self.inner.per_peer.remove_if(&self.src, |_, count| *count == 0);
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .finish_non_exhaustive()
    }
}

struct ForwarderInner {
    config: ForwarderConfig,
    circuits: DashMap<CircuitId, Arc<Circuit>>,
    /// Outstanding permits, spawned or not
    active: AtomicUsize,
    /// Outstanding permits per source peer
    per_peer: DashMap<PeerId, usize>,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    rejected: AtomicU64,
    /// Bytes relayed by circuits no longer in `circuits`
    retired_bytes: AtomicU64,
    idle: Notify,
    root: CancellationToken,
}

impl ForwarderInner {
    fn retire(&self, circuit: &Circuit) {
        self.retired_bytes
            .fetch_add(circuit.bytes_relayed(), Ordering::AcqRel);
        self.circuits.remove(&circuit.id);
        self.closed.fetch_add(1, Ordering::AcqRel);
        if self.circuits.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Owner of all live circuits
///
/// Cheap to clone; clones share circuits and counters.
#[derive(Clone)]
pub struct CircuitForwarder {
    inner: Arc<ForwarderInner>,
}

impl CircuitForwarder {
    /// Create a forwarder with its own cancellation root
    #[must_use]
    pub fn new(config: ForwarderConfig) -> Self {
        Self::with_parent(config, &CancellationToken::new())
    }

    /// Create a forwarder whose circuits are cancelled with `parent`
    #[must_use]
    pub fn with_parent(config: ForwarderConfig, parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                config,
                circuits: DashMap::new(),
                active: AtomicUsize::new(0),
                per_peer: DashMap::new(),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                retired_bytes: AtomicU64::new(0),
                idle: Notify::new(),
                root: parent.child_token(),
            }),
        }
    }

    /// Claim capacity for a circuit from `src` to `dst`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::SelfCircuit`] if `src == dst`, or
    /// [`CircuitError::CapacityExceeded`] if the node-wide or per-source
    /// limit is reached.
    pub fn admit(
        &self,
        src: PeerId,
        dst: PeerId,
        limits: CircuitLimits,
    ) -> Result<CircuitPermit, CircuitError> {
        if src == dst {
            self.inner.rejected.fetch_add(1, Ordering::AcqRel);
            return Err(CircuitError::SelfCircuit);
        }

        let max = self.inner.config.max_circuits;
        if self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            self.inner.rejected.fetch_add(1, Ordering::AcqRel);
            return Err(CircuitError::CapacityExceeded(CapacityScope::Node));
        }

        {
            let mut count = self.inner.per_peer.entry(src).or_insert(0);
            if *count >= self.inner.config.max_circuits_per_peer {
                drop(count);
                self.inner.active.fetch_sub(1, Ordering::AcqRel);
                self.inner.rejected.fetch_add(1, Ordering::AcqRel);
                return Err(CircuitError::CapacityExceeded(CapacityScope::Peer));
            }
            *count += 1;
        }

        Ok(CircuitPermit {
            inner: Arc::clone(&self.inner),
            src,
            dst,
            limits,
        })
    }

    /// Start relaying between two established streams
    ///
    /// `src_stream` faces the permit's source peer, `dst_stream` its
    /// destination. The permit is held until the circuit closes.
    pub fn spawn(
        &self,
        permit: CircuitPermit,
        src_stream: ByteStream,
        dst_stream: ByteStream,
    ) -> Arc<Circuit> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let circuit = Arc::new(Circuit {
            id,
            src: permit.src,
            dst: permit.dst,
            opened_at: Instant::now(),
            limits: permit.limits,
            bytes_relayed: AtomicU64::new(0),
            state: AtomicU8::new(CircuitState::Active as u8),
            reason: OnceLock::new(),
            cancel: self.inner.root.child_token(),
            done: CancellationToken::new(),
        });

        self.inner.circuits.insert(id, Arc::clone(&circuit));
        self.inner.opened.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            "Circuit {} opened: {} -> {} ({:?})",
            id,
            circuit.src.short(),
            circuit.dst.short(),
            circuit.limits
        );

        let inner = Arc::clone(&self.inner);
        let task_circuit = Arc::clone(&circuit);
        tokio::spawn(async move {
            run_circuit(&inner, &task_circuit, src_stream, dst_stream).await;
            drop(permit);
            inner.retire(&task_circuit);
            task_circuit.done.cancel();
        });

        circuit
    }

    /// Admit and spawn in one step
    ///
    /// # Errors
    ///
    /// Returns the errors of [`admit`](Self::admit).
    pub fn open(
        &self,
        src: PeerId,
        src_stream: ByteStream,
        dst: PeerId,
        dst_stream: ByteStream,
        limits: CircuitLimits,
    ) -> Result<Arc<Circuit>, CircuitError> {
        let permit = self.admit(src, dst, limits)?;
        Ok(self.spawn(permit, src_stream, dst_stream))
    }

    /// Close one circuit
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::NotFound`] if no live circuit has this id.
    pub fn close(&self, id: CircuitId, reason: CloseReason) -> Result<(), CircuitError> {
        let circuit = self.get(id).ok_or(CircuitError::NotFound(id))?;
        circuit.close(reason);
        Ok(())
    }

    /// Close every circuit touching `peer`, returning how many were signalled
    pub fn close_peer(&self, peer: &PeerId, reason: CloseReason) -> usize {
        self.circuits_for(peer)
            .iter()
            .filter(|circuit| circuit.close(reason))
            .count()
    }

    /// Close every live circuit, returning how many were signalled
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|circuit| circuit.close(reason))
            .count()
    }

    /// Wait up to `grace` for all circuits to finish
    ///
    /// Returns whether the forwarder is idle.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.circuits.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.circuits.is_empty();
            }
        }
    }

    /// Look up a live circuit
    #[must_use]
    pub fn get(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.inner
            .circuits
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Live circuits touching `peer`
    #[must_use]
    pub fn circuits_for(&self, peer: &PeerId) -> Vec<Arc<Circuit>> {
        self.inner
            .circuits
            .iter()
            .filter(|entry| entry.value().involves(peer))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner
            .circuits
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live circuits
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.circuits.len()
    }

    /// Whether no circuits are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.circuits.is_empty()
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        let live_bytes: u64 = self
            .inner
            .circuits
            .iter()
            .map(|entry| entry.value().bytes_relayed())
            .sum();
        ForwarderStats {
            opened: self.inner.opened.load(Ordering::Acquire),
            closed: self.inner.closed.load(Ordering::Acquire),
            rejected: self.inner.rejected.load(Ordering::Acquire),
            active: self.inner.circuits.len(),
            bytes_relayed: self.inner.retired_bytes.load(Ordering::Acquire) + live_bytes,
        }
    }
}

impl Default for CircuitForwarder {
    fn default() -> Self {
        Self::new(ForwarderConfig::default())
    }
}

impl fmt::Debug for CircuitForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitForwarder")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// How one copy direction ended
enum PumpEnd {
    Eof,
    DataLimit,
    Failed(std::io::Error),
}

/// Copy `reader` into `writer` until EOF, failure or the data budget runs out
///
/// On EOF the writer is shut down so the far side sees the half-close.
async fn pump<R, W>(
    circuit: &Circuit,
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    teardown: Duration,
) -> PumpEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tokio::time::timeout(teardown, writer.shutdown()).await;
                return PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) => return PumpEnd::Failed(e),
        };

        let granted = usize::try_from(circuit.admit_bytes(n as u64)).unwrap_or(n);
        if granted > 0 {
            if let Err(e) = writer.write_all(&buf[..granted]).await {
                return PumpEnd::Failed(e);
            }
            if let Err(e) = writer.flush().await {
                return PumpEnd::Failed(e);
            }
        }
        if granted < n || circuit.budget_exhausted() {
            return PumpEnd::DataLimit;
        }
    }
}

/// Drive both directions of a circuit and tear it down
async fn run_circuit(
    inner: &ForwarderInner,
    circuit: &Circuit,
    src_stream: ByteStream,
    dst_stream: ByteStream,
) {
    let buffer_size = inner.config.buffer_size;
    let teardown = inner.config.teardown_timeout;

    let (mut src_read, mut src_write) = tokio::io::split(src_stream);
    let (mut dst_read, mut dst_write) = tokio::io::split(dst_stream);

    let reason = {
        let forward = pump(circuit, &mut src_read, &mut dst_write, buffer_size, teardown);
        let backward = pump(circuit, &mut dst_read, &mut src_write, buffer_size, teardown);
        let deadline = circuit
            .limits
            .duration_limit
            .map(|limit| circuit.opened_at + limit);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(forward, backward, expiry);

        let mut forward_done = false;
        let mut backward_done = false;
        loop {
            tokio::select! {
                () = circuit.cancel.cancelled() => {
                    break circuit.close_reason().unwrap_or(CloseReason::Shutdown);
                }
                () = &mut expiry => break CloseReason::DurationLimit,
                end = &mut forward, if !forward_done => {
                    forward_done = true;
                    match end {
                        PumpEnd::Eof if backward_done => break CloseReason::Finished,
                        PumpEnd::Eof => {}
                        PumpEnd::DataLimit => break CloseReason::DataLimit,
                        PumpEnd::Failed(e) => {
                            tracing::debug!("Circuit {} src side failed: {}", circuit.id, e);
                            break CloseReason::StreamError;
                        }
                    }
                }
                end = &mut backward, if !backward_done => {
                    backward_done = true;
                    match end {
                        PumpEnd::Eof if forward_done => break CloseReason::Finished,
                        PumpEnd::Eof => {}
                        PumpEnd::DataLimit => break CloseReason::DataLimit,
                        PumpEnd::Failed(e) => {
                            tracing::debug!("Circuit {} dst side failed: {}", circuit.id, e);
                            break CloseReason::StreamError;
                        }
                    }
                }
            }
        }
    };

    let _ = circuit.reason.set(reason);
    circuit.begin_closing();
    let reason = circuit.close_reason().unwrap_or(reason);

    // Both write sides are shut down before the streams are dropped
    let _ = tokio::time::timeout(teardown, async {
        let _ = dst_write.shutdown().await;
        let _ = src_write.shutdown().await;
    })
    .await;
    drop((src_read, src_write, dst_read, dst_write));

    circuit
        .state
        .store(CircuitState::Closed as u8, Ordering::Release);

    tracing::debug!(
        "Circuit {} closed: {} -> {} ({}, {} bytes)",
        circuit.id,
        circuit.src.short(),
        circuit.dst.short(),
        reason,
        circuit.bytes_relayed()
    );
}
