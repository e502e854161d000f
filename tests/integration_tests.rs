//! Integration tests for Lantern
//!
//! End-to-end scenarios across the node coordinator, the relay service and
//! the discovery publisher, all on the in-memory transport.

use lantern_crypto::Identity;
use lantern_discovery::{Announcement, Topic};
use lantern_integration_tests::fixtures::{STEP_TIMEOUT, TestNetwork, memory_config};
use lantern_node::NodeConfig;
use lantern_relay::{RelayConfig, RelayError, Status};
use lantern_transport::{Multiaddr, MultiaddrExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const MB: usize = 1024 * 1024;

fn relay_only(relay: RelayConfig) -> NodeConfig {
    NodeConfig {
        relay,
        discovery_enabled: false,
        ..memory_config()
    }
}

fn rejection<T>(result: Result<T, RelayError>) -> Option<Status> {
    result.err().and_then(|e| e.status())
}

// ============================================================================
// Relay through a running node
// ============================================================================

#[tokio::test]
async fn test_node_rejects_reservation_beyond_capacity() {
    let net = TestNetwork::new();
    let node = net.node(relay_only(RelayConfig {
        max_reservations: 2,
        ..RelayConfig::default()
    }));
    node.start().await.unwrap();

    let first = net.peer(node.peer_id());
    let second = net.peer(node.peer_id());
    let third = net.peer(node.peer_id());

    assert!(first.client.reserve().await.is_ok());
    assert!(second.client.reserve().await.is_ok());
    assert_eq!(
        rejection(third.client.reserve().await),
        Some(Status::AtCapacity)
    );
    assert_eq!(node.relay().reservations().len(), 2);

    // Cancelling one frees a slot for the third peer
    first.client.cancel().await.unwrap();
    assert!(third.client.reserve().await.is_ok());

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_relayed_exchange_through_node() {
    let net = TestNetwork::new();
    let node = net.node(relay_only(RelayConfig::default()));
    node.start().await.unwrap();

    let listener = net.peer(node.peer_id());
    let dialer = net.peer(node.peer_id());
    let grant = listener.client.reserve().await.unwrap();
    assert_eq!(grant.limits.data_limit, Some(128 * 1024));

    let incoming = listener.accept_one();
    let mut outbound = dialer.client.connect(listener.peer_id()).await.unwrap();
    let mut inbound = timeout(STEP_TIMEOUT, incoming).await.unwrap().unwrap();
    assert_eq!(inbound.peer, dialer.peer_id());
    assert_eq!(inbound.relay, node.peer_id());

    outbound.stream.write_all(b"hello over the relay").await.unwrap();
    outbound.stream.shutdown().await.unwrap();
    let mut request = Vec::new();
    inbound.stream.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"hello over the relay");

    inbound.stream.write_all(b"ack").await.unwrap();
    inbound.stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    outbound.stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"ack");

    node.stop().await.unwrap();
    let stats = node.relay().forwarder().stats();
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.bytes_relayed, 23);
}

#[tokio::test]
async fn test_node_enforces_circuit_data_limit() {
    let net = TestNetwork::new();
    let node = net.node(relay_only(RelayConfig {
        circuit_data_limit: Some(MB as u64),
        ..RelayConfig::default()
    }));
    node.start().await.unwrap();

    let listener = net.peer(node.peer_id());
    let dialer = net.peer(node.peer_id());
    listener.client.reserve().await.unwrap();

    let incoming = listener.accept_one();
    let outbound = dialer.client.connect(listener.peer_id()).await.unwrap();
    let mut inbound = timeout(STEP_TIMEOUT, incoming).await.unwrap().unwrap();

    let mut writer = outbound.stream;
    let sender = tokio::spawn(async move {
        let chunk = vec![0xa5; 64 * 1024];
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
    timeout(STEP_TIMEOUT, inbound.stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), MB);

    assert!(node.relay().forwarder().drain(STEP_TIMEOUT).await);
    assert_eq!(node.relay().forwarder().stats().bytes_relayed, MB as u64);
    assert!(sender.await.unwrap() < 10 * MB);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_lets_finished_circuits_drain() {
    let net = TestNetwork::new();
    let node = net.node(NodeConfig {
        shutdown_grace: Duration::from_secs(2),
        ..relay_only(RelayConfig::default())
    });
    node.start().await.unwrap();

    let listener = net.peer(node.peer_id());
    let dialer = net.peer(node.peer_id());
    listener.client.reserve().await.unwrap();
    let incoming = listener.accept_one();
    let mut outbound = dialer.client.connect(listener.peer_id()).await.unwrap();
    let mut inbound = timeout(STEP_TIMEOUT, incoming).await.unwrap().unwrap();

    // Both sides finish while the node is draining
    let stopping = tokio::spawn({
        let node = node.clone();
        async move { node.stop().await }
    });
    outbound.stream.shutdown().await.unwrap();
    inbound.stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    inbound.stream.read_to_end(&mut rest).await.unwrap();

    timeout(STEP_TIMEOUT, stopping).await.unwrap().unwrap().unwrap();
    assert!(node.relay().forwarder().is_empty());
    assert!(!node.is_running());
}

// ============================================================================
// Discovery through a running node
// ============================================================================

#[tokio::test]
async fn test_dial_only_peer_finds_relay_through_discovery() {
    let net = TestNetwork::new();
    let node = net.node(memory_config());
    let topic_name = node.config().discovery.topic.clone();

    // A browser-like peer that only listens on the topic
    let browser = net.peer(node.peer_id());
    let topic = net.gossip().topic(topic_name, browser.peer_id());
    let mut subscription = topic.subscribe().unwrap();

    node.start().await.unwrap();

    let message = timeout(STEP_TIMEOUT, subscription.next())
        .await
        .unwrap()
        .unwrap();
    let announcement = Announcement::decode(&message.data).unwrap();
    assert!(announcement.verify().is_ok());
    assert_eq!(announcement.peer, node.peer_id());
    assert_eq!(announcement.addrs, node.registry().snapshot());
    assert!(!announcement.addrs.is_empty());

    // The announced peer is a working relay
    assert!(browser.client.reserve().await.is_ok());
    assert!(node.relay().reservations().is_reserved(&browser.peer_id()));

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_registry_change_is_reannounced() {
    let net = TestNetwork::new();
    let mut config = memory_config();
    config.discovery.refresh_interval = Duration::from_millis(200);

    let listener = net.node(config.clone());
    let announcer = net.node(config);
    listener.start().await.unwrap();
    let mut accepted = listener.discovery().unwrap().subscribe_announcements();
    announcer.start().await.unwrap();

    let external: Multiaddr = "/ip4/203.0.113.7/tcp/4001".parse().unwrap();
    assert!(announcer.registry().add(external.clone()));

    let seen = timeout(STEP_TIMEOUT, async {
        loop {
            let announcement = accepted.recv().await.unwrap();
            if announcement.peer == announcer.peer_id() && announcement.addrs.contains(&external)
            {
                return announcement;
            }
        }
    })
    .await
    .unwrap();

    let cached = listener
        .discovery()
        .unwrap()
        .get(&announcer.peer_id())
        .unwrap();
    assert!(cached.sequence >= seen.sequence);
    assert!(cached.addrs.contains(&external));

    announcer.stop().await.unwrap();
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_join_keeps_one_subscription() {
    let net = TestNetwork::new();
    let node = net.node(memory_config());
    let topic_name = node.config().discovery.topic.clone();
    node.start().await.unwrap();

    let discovery = node.discovery().unwrap();
    assert!(discovery.is_joined());
    assert!(!discovery.join().unwrap());
    assert!(!discovery.join().unwrap());
    assert_eq!(net.gossip().subscriber_count(&topic_name), 1);

    node.stop().await.unwrap();
    assert!(!discovery.is_joined());
    assert_eq!(net.gossip().subscriber_count(&topic_name), 0);
}

#[tokio::test]
async fn test_discovery_disabled_node_stays_silent() {
    let net = TestNetwork::new();
    let node = net.node(relay_only(RelayConfig::default()));
    let observer = net
        .gossip()
        .topic(node.config().discovery.topic.clone(), Identity::generate().peer_id());
    let mut subscription = observer.subscribe().unwrap();

    node.start().await.unwrap();
    assert!(node.discovery().is_none());
    assert!(
        timeout(Duration::from_millis(200), subscription.next())
            .await
            .is_err()
    );
    node.stop().await.unwrap();
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_persisted_identity_keeps_peer_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.key");

    let first = Identity::load_or_generate(&path).unwrap();
    let second = Identity::load_or_generate(&path).unwrap();
    assert_eq!(first.peer_id(), second.peer_id());

    let net = TestNetwork::new();
    let node = net.node_with(Arc::new(second), relay_only(RelayConfig::default()));
    node.start().await.unwrap();
    assert_eq!(node.peer_id(), first.peer_id());
    assert!(
        node.listen_addrs()
            .iter()
            .all(|addr| addr.peer_id() == Some(first.peer_id()))
    );
    node.stop().await.unwrap();
}
