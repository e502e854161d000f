//! Relay errors.

use crate::circuit::CircuitId;
use crate::protocol::Status;
use lantern_transport::TransportError;
use std::fmt;

/// Which capacity bound rejected a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    /// Node-wide circuit limit
    Node,
    /// Per-source-peer circuit limit
    Peer,
}

impl fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityScope::Node => f.write_str("node"),
            CapacityScope::Peer => f.write_str("peer"),
        }
    }
}

/// Reservation admission errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    /// Table holds its maximum of live reservations
    #[error("reservation table at capacity ({capacity})")]
    AtCapacity {
        /// Configured capacity
        capacity: usize,
    },
}

/// Circuit admission and forwarding errors
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// Source and destination are the same peer
    #[error("circuit source and destination are the same peer")]
    SelfCircuit,

    /// A concurrent-circuit limit is reached
    #[error("{0} circuit capacity exceeded")]
    CapacityExceeded(CapacityScope),

    /// A stream faulted mid-transfer
    #[error("stream error: {0}")]
    StreamError(String),

    /// No circuit with this id is live
    #[error("circuit {0} not found")]
    NotFound(CircuitId),
}

impl CircuitError {
    /// Status reported to the requesting peer
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            CircuitError::SelfCircuit => Status::PermissionDenied,
            CircuitError::CapacityExceeded(CapacityScope::Node) => Status::AtCapacity,
            CircuitError::CapacityExceeded(CapacityScope::Peer) => Status::PeerCapacityExceeded,
            CircuitError::StreamError(_) | CircuitError::NotFound(_) => Status::ConnectionFailed,
        }
    }
}

/// Errors seen by relay clients and the service's outbound side
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Remote answered with a non-OK status
    #[error("request rejected: {0}")]
    Rejected(Status),

    /// Remote did not answer in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Remote sent something that does not fit the protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Circuit admission failed
    #[error(transparent)]
    Circuit(#[from] CircuitError),
}

impl RelayError {
    /// Status carried by a rejection, if any
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self {
            RelayError::Rejected(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
