//! End-to-end relay scenarios over the in-memory transport.

use lantern_crypto::Identity;
use lantern_relay::{RelayClient, RelayConfig, RelayError, RelayService, RelayedStream, Status};
use lantern_transport::{MemoryNetwork, MemoryTransport, PeerId, ProtocolHandler, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MB: usize = 1024 * 1024;

struct Harness {
    network: MemoryNetwork,
    relay: RelayService,
    relay_id: PeerId,
}

impl Harness {
    fn new(config: RelayConfig) -> Self {
        let network = MemoryNetwork::new();
        let transport = Arc::new(MemoryTransport::new(
            &network,
            Identity::generate().peer_id(),
        ));
        let relay_id = transport.local_peer();
        let relay = RelayService::new(transport.clone(), config);

        let handler = relay.clone();
        tokio::spawn(async move {
            while let Ok(inbound) = transport.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle(inbound).await });
            }
        });

        Self {
            network,
            relay,
            relay_id,
        }
    }

    fn peer(&self) -> (Arc<MemoryTransport>, RelayClient) {
        let transport = Arc::new(MemoryTransport::new(
            &self.network,
            Identity::generate().peer_id(),
        ));
        let client = RelayClient::new(transport.clone(), self.relay_id);
        (transport, client)
    }
}

/// Accept the next stop request arriving at `transport`
fn accept_one(transport: Arc<MemoryTransport>) -> tokio::task::JoinHandle<RelayedStream> {
    tokio::spawn(async move {
        let inbound = transport.accept().await.unwrap();
        RelayClient::accept_stop(inbound).await.unwrap()
    })
}

fn rejection(result: Result<impl Sized, RelayError>) -> Option<Status> {
    result.err().and_then(|e| e.status())
}

#[tokio::test]
async fn test_third_reservation_rejected_at_capacity() {
    let harness = Harness::new(RelayConfig {
        max_reservations: 2,
        ..RelayConfig::default()
    });
    let (_t1, c1) = harness.peer();
    let (_t2, c2) = harness.peer();
    let (_t3, c3) = harness.peer();

    assert!(c1.reserve().await.is_ok());
    assert!(c2.reserve().await.is_ok());
    assert_eq!(rejection(c3.reserve().await), Some(Status::AtCapacity));
    assert_eq!(harness.relay.reservations().len(), 2);
}

#[tokio::test]
async fn test_repeat_reservation_is_idempotent() {
    let harness = Harness::new(RelayConfig::default());
    let (_t, client) = harness.peer();

    let first = client.reserve().await.unwrap();
    let second = client.reserve().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(harness.relay.reservations().len(), 1);
}

#[tokio::test]
async fn test_connect_without_reservation() {
    let harness = Harness::new(RelayConfig::default());
    let (a, _) = harness.peer();
    let (_b, client_b) = harness.peer();

    assert_eq!(
        rejection(client_b.connect(a.local_peer()).await),
        Some(Status::NoReservation)
    );
    assert_eq!(harness.relay.forwarder().stats().opened, 0);
}

#[tokio::test]
async fn test_relayed_echo_with_half_close() {
    let harness = Harness::new(RelayConfig {
        circuit_data_limit: None,
        ..RelayConfig::default()
    });
    let (a, client_a) = harness.peer();
    let (b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    let incoming = accept_one(a.clone());

    let mut outbound = client_b.connect(a.local_peer()).await.unwrap();
    let mut inbound = incoming.await.unwrap();
    assert_eq!(inbound.peer, b.local_peer());
    assert_eq!(inbound.relay, harness.relay_id);

    outbound.stream.write_all(b"ping").await.unwrap();
    outbound.stream.shutdown().await.unwrap();

    let mut request = Vec::new();
    inbound.stream.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"ping");

    inbound.stream.write_all(b"pong").await.unwrap();
    inbound.stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    outbound.stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong");

    assert!(harness.relay.forwarder().drain(Duration::from_secs(5)).await);
    assert_eq!(harness.relay.forwarder().stats().bytes_relayed, 8);
}

#[tokio::test]
async fn test_data_limit_stops_relaying() {
    let harness = Harness::new(RelayConfig {
        circuit_data_limit: Some(MB as u64),
        ..RelayConfig::default()
    });
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    let incoming = accept_one(a.clone());

    let outbound = client_b.connect(a.local_peer()).await.unwrap();
    assert_eq!(outbound.limits.data_limit, Some(MB as u64));
    let mut inbound = incoming.await.unwrap();

    let mut writer = outbound.stream;
    let sender = tokio::spawn(async move {
        let chunk = vec![0x5a; 64 * 1024];
        let mut sent = 0;
        while sent < 10 * MB {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
            sent += chunk.len();
        }
        sent
    });

    let mut received = Vec::new();
    inbound.stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), MB);
    assert!(received.iter().all(|b| *b == 0x5a));

    assert!(harness.relay.forwarder().drain(Duration::from_secs(5)).await);
    assert_eq!(harness.relay.forwarder().stats().bytes_relayed, MB as u64);
    assert!(sender.await.unwrap() < 10 * MB);
}

#[tokio::test]
async fn test_self_and_relay_targets_denied() {
    let harness = Harness::new(RelayConfig::default());
    let (a, client_a) = harness.peer();
    client_a.reserve().await.unwrap();

    assert_eq!(
        rejection(client_a.connect(a.local_peer()).await),
        Some(Status::PermissionDenied)
    );
    assert_eq!(
        rejection(client_a.connect(harness.relay_id).await),
        Some(Status::PermissionDenied)
    );
}

#[tokio::test]
async fn test_unreachable_destination() {
    let harness = Harness::new(RelayConfig::default());
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    a.disconnect();

    assert_eq!(
        rejection(client_b.connect(a.local_peer()).await),
        Some(Status::ConnectionFailed)
    );
    // The claimed capacity was released
    assert_eq!(harness.relay.forwarder().len(), 0);
}

#[tokio::test]
async fn test_per_peer_circuit_cap() {
    let harness = Harness::new(RelayConfig {
        max_circuits_per_peer: 1,
        ..RelayConfig::default()
    });
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    let incoming = accept_one(a.clone());
    let _first = client_b.connect(a.local_peer()).await.unwrap();
    let _accepted = incoming.await.unwrap();

    assert_eq!(
        rejection(client_b.connect(a.local_peer()).await),
        Some(Status::PeerCapacityExceeded)
    );
}

#[tokio::test]
async fn test_revoke_closes_circuits() {
    let harness = Harness::new(RelayConfig::default());
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    let incoming = accept_one(a.clone());
    let mut outbound = client_b.connect(a.local_peer()).await.unwrap();
    let _inbound = incoming.await.unwrap();
    assert_eq!(harness.relay.forwarder().len(), 1);

    assert!(harness.relay.revoke(&a.local_peer()));

    let mut rest = Vec::new();
    outbound.stream.read_to_end(&mut rest).await.unwrap();
    assert!(harness.relay.forwarder().drain(Duration::from_secs(5)).await);
    assert!(!harness.relay.reservations().is_reserved(&a.local_peer()));
}

#[tokio::test]
async fn test_cancelled_reservation() {
    let harness = Harness::new(RelayConfig::default());
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    client_a.cancel().await.unwrap();

    assert_eq!(
        rejection(client_b.connect(a.local_peer()).await),
        Some(Status::NoReservation)
    );
}

#[tokio::test]
async fn test_draining_relay_refuses_new_work() {
    let harness = Harness::new(RelayConfig::default());
    let (a, client_a) = harness.peer();
    let (_b, client_b) = harness.peer();

    client_a.reserve().await.unwrap();
    harness.relay.stop_accepting();

    assert_eq!(
        rejection(client_b.connect(a.local_peer()).await),
        Some(Status::AtCapacity)
    );
    assert_eq!(rejection(client_b.reserve().await), Some(Status::AtCapacity));
}
