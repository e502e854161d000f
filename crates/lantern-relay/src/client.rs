//! Relay client: the peer side of the relay protocols.

use crate::error::{RelayError, RelayResult};
use crate::protocol::{
    CONNECT_PROTOCOL, CircuitLimits, ConnectRequest, ConnectResponse, RESERVE_PROTOCOL,
    ReserveRequest, ReserveResponse, STOP_PROTOCOL, Status, StopRequest, StopResponse,
};
use lantern_transport::framing::{read_message, write_message};
use lantern_transport::{ByteStream, InboundStream, PeerId, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Default time to wait for a relay response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A granted reservation, as seen by the reserved peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationGrant {
    /// Expiry as Unix seconds
    pub expires_at: u64,
    /// Limits on circuits towards us
    pub limits: CircuitLimits,
}

/// An established relayed stream
pub struct RelayedStream {
    /// Peer at the far end of the circuit
    pub peer: PeerId,
    /// Relay carrying the circuit
    pub relay: PeerId,
    /// Limits the relay enforces
    pub limits: CircuitLimits,
    /// Raw bytes to and from `peer`
    pub stream: ByteStream,
}

impl std::fmt::Debug for RelayedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedStream")
            .field("peer", &self.peer)
            .field("relay", &self.relay)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Client for one relay
pub struct RelayClient {
    transport: Arc<dyn Transport>,
    relay: PeerId,
    timeout: Duration,
}

impl RelayClient {
    /// Create a client talking to `relay` over `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, relay: PeerId) -> Self {
        Self {
            transport,
            relay,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Override the response timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Relay this client talks to
    #[must_use]
    pub fn relay(&self) -> PeerId {
        self.relay
    }

    async fn exchange<Req, Resp>(&self, protocol: &str, request: &Req) -> RelayResult<(ByteStream, Resp)>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned + Send,
    {
        let exchange = async {
            let mut stream = self.transport.open_stream(&self.relay, protocol).await?;
            write_message(&mut stream, request).await?;
            let response: Resp = read_message(&mut stream).await?;
            Ok::<_, RelayError>((stream, response))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RelayError::Timeout("relay response"))?
    }

    /// Reserve a slot so other peers can reach us through the relay
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Rejected`] with the relay's status if the
    /// reservation is refused, or a transport error.
    pub async fn reserve(&self) -> RelayResult<ReservationGrant> {
        let request = ReserveRequest::Reserve {
            peer: self.transport.local_peer(),
        };
        let (_, response): (_, ReserveResponse) =
            self.exchange(RESERVE_PROTOCOL, &request).await?;

        if !response.status.is_ok() {
            return Err(RelayError::Rejected(response.status));
        }
        match (response.expires_at, response.limits) {
            (Some(expires_at), Some(limits)) => Ok(ReservationGrant { expires_at, limits }),
            _ => Err(RelayError::Protocol(
                "reservation granted without expiry or limits".into(),
            )),
        }
    }

    /// Give up our reservation
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Rejected`] if the relay refuses, or a transport
    /// error.
    pub async fn cancel(&self) -> RelayResult<()> {
        let request = ReserveRequest::Cancel {
            peer: self.transport.local_peer(),
        };
        let (_, response): (_, ReserveResponse) =
            self.exchange(RESERVE_PROTOCOL, &request).await?;
        match response.status {
            Status::Ok => Ok(()),
            status => Err(RelayError::Rejected(status)),
        }
    }

    /// Open a circuit to `dst` through the relay
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Rejected`] with the relay's status (for example
    /// `NoReservation`) if the circuit is refused.
    pub async fn connect(&self, dst: PeerId) -> RelayResult<RelayedStream> {
        let (stream, response): (_, ConnectResponse) = self
            .exchange(CONNECT_PROTOCOL, &ConnectRequest { dst })
            .await?;

        if !response.status.is_ok() {
            return Err(RelayError::Rejected(response.status));
        }
        Ok(RelayedStream {
            peer: dst,
            relay: self.relay,
            limits: response.limits.unwrap_or_default(),
            stream,
        })
    }

    /// Accept a stop request delivered by a relay
    ///
    /// `inbound` must be a stream on the stop protocol. The returned stream
    /// carries raw bytes from the circuit's source peer.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if `inbound` is not a stop stream,
    /// or a transport error if the exchange fails.
    pub async fn accept_stop(inbound: InboundStream) -> RelayResult<RelayedStream> {
        if inbound.protocol != STOP_PROTOCOL {
            return Err(RelayError::Protocol(format!(
                "expected {STOP_PROTOCOL}, got {}",
                inbound.protocol
            )));
        }

        let mut stream = inbound.stream;
        let request: StopRequest = tokio::time::timeout(DEFAULT_RESPONSE_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| RelayError::Timeout("stop request"))??;
        write_message(&mut stream, &StopResponse { status: Status::Ok }).await?;

        tracing::debug!(
            "Accepted relayed circuit from {} via {}",
            request.src.short(),
            inbound.peer.short()
        );

        Ok(RelayedStream {
            peer: request.src,
            relay: inbound.peer,
            limits: request.limits,
            stream,
        })
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("local", &self.transport.local_peer())
            .field("relay", &self.relay)
            .field("timeout", &self.timeout)
            .finish()
    }
}
