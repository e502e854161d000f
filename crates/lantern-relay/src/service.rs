//! Relay service: the relay side of the reserve and connect protocols.
//!
//! Each inbound request runs on its own task and moves through
//! `Received → Validating → {Admitted, Rejected}`. A rejected request gets a
//! status and its stream is closed; an admitted connect request hands both
//! streams to the [`CircuitForwarder`].
//!
//! Connect validation order:
//!
//! 1. `dst` is neither the requester nor this relay (`PermissionDenied`)
//! 2. `dst` holds a live reservation (`NoReservation`)
//! 3. capacity is claimed atomically (`AtCapacity`, `PeerCapacityExceeded`)
//! 4. the destination accepts a stop request (`ConnectionFailed`)
//! 5. the reservation is re-checked, since it may have been revoked while
//!    dialling

use crate::circuit::{CircuitForwarder, CloseReason};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{
    CONNECT_PROTOCOL, CircuitLimits, ConnectRequest, ConnectResponse, RESERVE_PROTOCOL,
    ReserveRequest, ReserveResponse, STOP_PROTOCOL, Status, StopRequest, StopResponse,
};
use crate::reservation::ReservationTable;
use async_trait::async_trait;
use lantern_transport::framing::{read_message, write_message};
use lantern_transport::{
    ByteStream, InboundStream, PeerId, ProtocolHandler, Transport, TransportError,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Phase of an in-flight request, for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Received,
    Validating,
    Admitted,
    Rejected(Status),
}

/// Relay side of the circuit relay protocol
///
/// Cheap to clone; clones share reservations and circuits.
#[derive(Clone)]
pub struct RelayService {
    transport: Arc<dyn Transport>,
    local: PeerId,
    config: RelayConfig,
    reservations: Arc<ReservationTable>,
    forwarder: CircuitForwarder,
    accepting: Arc<AtomicBool>,
}

impl RelayService {
    /// Create a relay service on `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: RelayConfig) -> Self {
        Self::with_parent(transport, config, &CancellationToken::new())
    }

    /// Create a relay service whose circuits are cancelled with `parent`
    #[must_use]
    pub fn with_parent(
        transport: Arc<dyn Transport>,
        config: RelayConfig,
        parent: &CancellationToken,
    ) -> Self {
        let reservations = Arc::new(ReservationTable::new(
            config.max_reservations,
            config.reservation_ttl,
            config.limits(),
        ));
        let forwarder = CircuitForwarder::with_parent(config.forwarder(), parent);
        Self {
            local: transport.local_peer(),
            transport,
            config,
            reservations,
            forwarder,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Reservation table
    #[must_use]
    pub fn reservations(&self) -> &Arc<ReservationTable> {
        &self.reservations
    }

    /// Circuit forwarder
    #[must_use]
    pub fn forwarder(&self) -> &CircuitForwarder {
        &self.forwarder
    }

    /// Service configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Drop `peer`'s reservation and close every circuit touching it
    ///
    /// Returns whether a reservation existed.
    pub fn revoke(&self, peer: &PeerId) -> bool {
        let existed = self.reservations.revoke(peer).is_some();
        let closed = self.forwarder.close_peer(peer, CloseReason::Revoked);
        tracing::info!(
            "Revoked {} (reservation: {}, circuits closed: {})",
            peer.short(),
            existed,
            closed
        );
        existed
    }

    /// Answer all further requests with `AtCapacity`
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Whether new requests are being served
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Start the periodic reservation sweep
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.reservations
            .spawn_sweeper(self.config.sweep_interval, cancel)
    }

    fn trace_phase(&self, protocol: &str, peer: &PeerId, phase: Phase) {
        tracing::trace!("{} from {}: {:?}", protocol, peer.short(), phase);
    }

    /// Read a request frame within the request timeout
    ///
    /// `Ok(None)` means the request was malformed; the caller answers with
    /// `Malformed`. I/O failures and timeouts end the request silently.
    async fn read_request<T: DeserializeOwned>(
        &self,
        stream: &mut ByteStream,
    ) -> Result<Option<T>, TransportError> {
        match tokio::time::timeout(self.config.request_timeout, read_message(stream)).await {
            Err(_) => Err(TransportError::Timeout("request")),
            Ok(Ok(request)) => Ok(Some(request)),
            Ok(Err(e)) if e.is_malformed() => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn handle_reserve(&self, peer: PeerId, mut stream: ByteStream) -> RelayResult<()> {
        self.trace_phase(RESERVE_PROTOCOL, &peer, Phase::Received);
        let Some(request) = self.read_request::<ReserveRequest>(&mut stream).await? else {
            self.trace_phase(RESERVE_PROTOCOL, &peer, Phase::Rejected(Status::Malformed));
            write_message(&mut stream, &ReserveResponse::status(Status::Malformed)).await?;
            return Ok(());
        };

        self.trace_phase(RESERVE_PROTOCOL, &peer, Phase::Validating);
        let response = self.validate_reserve(peer, &request);
        let phase = if response.status.is_ok() {
            Phase::Admitted
        } else {
            Phase::Rejected(response.status)
        };
        self.trace_phase(RESERVE_PROTOCOL, &peer, phase);

        write_message(&mut stream, &response).await?;
        Ok(())
    }

    fn validate_reserve(&self, peer: PeerId, request: &ReserveRequest) -> ReserveResponse {
        if request.peer() != peer {
            tracing::debug!(
                "{} sent a reservation request naming {}",
                peer.short(),
                request.peer().short()
            );
            return ReserveResponse::status(Status::PermissionDenied);
        }

        match request {
            ReserveRequest::Cancel { .. } => {
                self.revoke(&peer);
                ReserveResponse::status(Status::Ok)
            }
            ReserveRequest::Reserve { .. } if !self.is_accepting() => {
                ReserveResponse::status(Status::AtCapacity)
            }
            ReserveRequest::Reserve { .. } => match self.reservations.reserve(peer) {
                Ok(reservation) => {
                    tracing::debug!(
                        "Reservation for {} valid for {:?}",
                        peer.short(),
                        reservation.remaining_at(tokio::time::Instant::now())
                    );
                    ReserveResponse {
                        status: Status::Ok,
                        expires_at: Some(reservation.expires_at_unix()),
                        limits: Some(reservation.limits),
                    }
                }
                Err(e) => {
                    tracing::debug!("Reservation for {} rejected: {}", peer.short(), e);
                    ReserveResponse::status(Status::AtCapacity)
                }
            },
        }
    }

    async fn handle_connect(&self, src: PeerId, mut stream: ByteStream) -> RelayResult<()> {
        self.trace_phase(CONNECT_PROTOCOL, &src, Phase::Received);
        let Some(request) = self.read_request::<ConnectRequest>(&mut stream).await? else {
            return self.reject_connect(src, stream, Status::Malformed).await;
        };
        let dst = request.dst;

        self.trace_phase(CONNECT_PROTOCOL, &src, Phase::Validating);
        if !self.is_accepting() {
            return self.reject_connect(src, stream, Status::AtCapacity).await;
        }
        if dst == src || dst == self.local {
            return self
                .reject_connect(src, stream, Status::PermissionDenied)
                .await;
        }
        let Some(reservation) = self.reservations.get(&dst) else {
            return self.reject_connect(src, stream, Status::NoReservation).await;
        };

        let permit = match self.forwarder.admit(src, dst, reservation.limits) {
            Ok(permit) => permit,
            Err(e) => return self.reject_connect(src, stream, e.status()).await,
        };

        let dst_stream = match self.open_stop(src, dst, reservation.limits).await {
            Ok(dst_stream) => dst_stream,
            Err(e) => {
                tracing::debug!("Stop to {} failed: {}", dst.short(), e);
                return self
                    .reject_connect(src, stream, Status::ConnectionFailed)
                    .await;
            }
        };

        if !self.reservations.is_reserved(&dst) {
            drop(dst_stream);
            return self.reject_connect(src, stream, Status::NoReservation).await;
        }

        let response = ConnectResponse {
            status: Status::Ok,
            limits: Some(permit.limits()),
        };
        write_message(&mut stream, &response).await?;
        self.trace_phase(CONNECT_PROTOCOL, &src, Phase::Admitted);

        let circuit = self.forwarder.spawn(permit, stream, dst_stream);
        tracing::info!(
            "Relaying circuit {}: {} -> {}",
            circuit.id(),
            src.short(),
            dst.short()
        );
        Ok(())
    }

    async fn reject_connect(
        &self,
        src: PeerId,
        mut stream: ByteStream,
        status: Status,
    ) -> RelayResult<()> {
        self.trace_phase(CONNECT_PROTOCOL, &src, Phase::Rejected(status));
        let response = ConnectResponse {
            status,
            limits: None,
        };
        write_message(&mut stream, &response).await?;
        Ok(())
    }

    /// Open a stop stream to `dst` announcing a circuit from `src`
    async fn open_stop(
        &self,
        src: PeerId,
        dst: PeerId,
        limits: CircuitLimits,
    ) -> RelayResult<ByteStream> {
        let exchange = async {
            let mut stream = self.transport.open_stream(&dst, STOP_PROTOCOL).await?;
            write_message(&mut stream, &StopRequest { src, limits }).await?;
            let response: StopResponse = read_message(&mut stream).await?;
            if response.status.is_ok() {
                Ok(stream)
            } else {
                Err(RelayError::Rejected(response.status))
            }
        };
        tokio::time::timeout(self.config.request_timeout, exchange)
            .await
            .map_err(|_| RelayError::Timeout("stop response"))?
    }
}

#[async_trait]
impl ProtocolHandler for RelayService {
    fn protocols(&self) -> Vec<&'static str> {
        vec![RESERVE_PROTOCOL, CONNECT_PROTOCOL]
    }

    async fn handle(&self, inbound: InboundStream) {
        let InboundStream {
            peer,
            protocol,
            stream,
        } = inbound;

        let result = match protocol.as_str() {
            RESERVE_PROTOCOL => self.handle_reserve(peer, stream).await,
            CONNECT_PROTOCOL => self.handle_connect(peer, stream).await,
            other => {
                tracing::debug!("Relay ignoring protocol {} from {}", other, peer.short());
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!("{} request from {} ended: {}", protocol, peer.short(), e);
        }
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("local", &self.local)
            .field("reservations", &self.reservations.len())
            .field("circuits", &self.forwarder.len())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_transport::{MemoryNetwork, MemoryTransport};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn service(network: &MemoryNetwork, config: RelayConfig) -> RelayService {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(network, peer(100)));
        RelayService::new(transport, config)
    }

    #[tokio::test]
    async fn test_reserve_for_other_peer_denied() {
        let network = MemoryNetwork::new();
        let service = service(&network, RelayConfig::default());
        let response = service.validate_reserve(peer(1), &ReserveRequest::Reserve { peer: peer(2) });
        assert_eq!(response.status, Status::PermissionDenied);
        assert!(service.reservations().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_then_cancel() {
        let network = MemoryNetwork::new();
        let service = service(&network, RelayConfig::default());

        let granted = service.validate_reserve(peer(1), &ReserveRequest::Reserve { peer: peer(1) });
        assert_eq!(granted.status, Status::Ok);
        assert!(granted.expires_at.is_some());
        assert_eq!(granted.limits, Some(RelayConfig::default().limits()));
        assert!(service.reservations().is_reserved(&peer(1)));

        let cancelled = service.validate_reserve(peer(1), &ReserveRequest::Cancel { peer: peer(1) });
        assert_eq!(cancelled.status, Status::Ok);
        assert!(!service.reservations().is_reserved(&peer(1)));
    }

    #[tokio::test]
    async fn test_draining_answers_at_capacity() {
        let network = MemoryNetwork::new();
        let service = service(&network, RelayConfig::default());
        service.stop_accepting();
        let response = service.validate_reserve(peer(1), &ReserveRequest::Reserve { peer: peer(1) });
        assert_eq!(response.status, Status::AtCapacity);
    }

    #[tokio::test]
    async fn test_malformed_reserve_request() {
        let network = MemoryNetwork::new();
        let service = service(&network, RelayConfig::default());

        let (mut client, relay_end) = tokio::io::duplex(1024);
        let handler = service.clone();
        let task = tokio::spawn(async move {
            handler
                .handle(InboundStream {
                    peer: peer(1),
                    protocol: RESERVE_PROTOCOL.into(),
                    stream: Box::new(relay_end),
                })
                .await;
        });

        lantern_transport::framing::write_frame(&mut client, &[0xde, 0xad])
            .await
            .unwrap();
        let response: ReserveResponse = read_message(&mut client).await.unwrap();
        assert_eq!(response.status, Status::Malformed);
        task.await.unwrap();
    }

    #[test]
    fn test_protocols() {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(&network, peer(100)));
        let service = RelayService::new(transport, RelayConfig::default());
        assert_eq!(service.protocols(), vec![RESERVE_PROTOCOL, CONNECT_PROTOCOL]);
    }
}
