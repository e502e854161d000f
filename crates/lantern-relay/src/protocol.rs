//! Relay protocol message definitions.
//!
//! Each exchange runs on its own stream, opened with one of the protocol ids
//! below. Requests and responses are single length-prefixed bincode frames
//! (see [`lantern_transport::framing`]); after an `OK` on the connect and
//! stop protocols the stream carries raw relayed bytes.

use lantern_transport::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Reservation protocol (peer to relay)
pub const RESERVE_PROTOCOL: &str = "/lantern/relay/reserve/1.0.0";

/// Connect protocol (source peer to relay)
pub const CONNECT_PROTOCOL: &str = "/lantern/relay/connect/1.0.0";

/// Stop protocol (relay to destination peer)
pub const STOP_PROTOCOL: &str = "/lantern/relay/stop/1.0.0";

/// Response status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    /// Request granted
    Ok,
    /// Relay has no room for another reservation or circuit
    AtCapacity,
    /// Destination holds no valid reservation
    NoReservation,
    /// Request could not be decoded
    Malformed,
    /// Source peer already has its maximum of open circuits
    PeerCapacityExceeded,
    /// Relay could not reach the destination
    ConnectionFailed,
    /// Request is not allowed for this peer
    PermissionDenied,
}

impl Status {
    /// Whether the request was granted
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Stable name for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::AtCapacity => "AT_CAPACITY",
            Status::NoReservation => "NO_RESERVATION",
            Status::Malformed => "MALFORMED",
            Status::PeerCapacityExceeded => "PEER_CAPACITY_EXCEEDED",
            Status::ConnectionFailed => "CONNECTION_FAILED",
            Status::PermissionDenied => "PERMISSION_DENIED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits applied to every circuit towards a reserved peer
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitLimits {
    /// Maximum bytes relayed, both directions combined
    pub data_limit: Option<u64>,
    /// Maximum circuit lifetime
    pub duration_limit: Option<Duration>,
}

impl CircuitLimits {
    /// No limits
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            data_limit: None,
            duration_limit: None,
        }
    }
}

/// Sent on [`RESERVE_PROTOCOL`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReserveRequest {
    /// Register as reachable through the relay
    Reserve {
        /// Must equal the stream's authenticated peer
        peer: PeerId,
    },
    /// Give up an existing reservation
    Cancel {
        /// Must equal the stream's authenticated peer
        peer: PeerId,
    },
}

impl ReserveRequest {
    /// Peer named in the request
    #[must_use]
    pub fn peer(&self) -> PeerId {
        match self {
            ReserveRequest::Reserve { peer } | ReserveRequest::Cancel { peer } => *peer,
        }
    }
}

/// Reply on [`RESERVE_PROTOCOL`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReserveResponse {
    /// Outcome
    pub status: Status,
    /// Expiry as Unix seconds, set when a reservation was granted
    pub expires_at: Option<u64>,
    /// Limits for circuits to the reserved peer
    pub limits: Option<CircuitLimits>,
}

impl ReserveResponse {
    /// Response carrying only a status
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            status,
            expires_at: None,
            limits: None,
        }
    }
}

/// Sent on [`CONNECT_PROTOCOL`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Destination peer
    pub dst: PeerId,
}

/// Reply on [`CONNECT_PROTOCOL`]; an `Ok` is followed by relayed bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Outcome
    pub status: Status,
    /// Limits of the opened circuit
    pub limits: Option<CircuitLimits>,
}

/// Sent by the relay on [`STOP_PROTOCOL`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopRequest {
    /// Peer the circuit comes from
    pub src: PeerId,
    /// Limits of the circuit
    pub limits: CircuitLimits,
}

/// Destination's reply on [`STOP_PROTOCOL`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopResponse {
    /// Outcome
    pub status: Status,
}
