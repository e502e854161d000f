//! In-memory network fixtures
//!
//! A [`TestNetwork`] wires nodes and bare relay clients onto one
//! [`MemoryNetwork`] and one [`MemoryGossip`] hub, so scenarios run without
//! sockets and without timing flakiness from real I/O.

use lantern_crypto::Identity;
use lantern_discovery::MemoryGossip;
use lantern_node::{Node, NodeConfig};
use lantern_relay::{RelayClient, RelayedStream};
use lantern_transport::{MemoryNetwork, MemoryTransport, PeerId, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Upper bound for any single step of a scenario
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Node configuration bound to the in-memory transport
#[must_use]
pub fn memory_config() -> NodeConfig {
    NodeConfig {
        listen: vec!["/memory/0".parse().expect("valid memory multiaddr")],
        shutdown_grace: Duration::from_millis(200),
        ..NodeConfig::default()
    }
}

/// One in-memory network plus a shared gossip hub
#[derive(Default)]
pub struct TestNetwork {
    network: MemoryNetwork,
    gossip: MemoryGossip,
}

impl TestNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying transport network
    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Gossip hub shared by every node
    #[must_use]
    pub fn gossip(&self) -> &MemoryGossip {
        &self.gossip
    }

    /// Build (but do not start) a node with a fresh identity
    pub fn node(&self, config: NodeConfig) -> Node {
        self.node_with(Arc::new(Identity::generate()), config)
    }

    /// Build (but do not start) a node with `identity`
    pub fn node_with(&self, identity: Arc<Identity>, config: NodeConfig) -> Node {
        let transport = Arc::new(MemoryTransport::new(&self.network, identity.peer_id()));
        let topic = Arc::new(
            self.gossip
                .topic(config.discovery.topic.clone(), identity.peer_id()),
        );
        Node::with_topic(identity, transport, topic, config).expect("valid node config")
    }

    /// Attach a bare peer that talks to `relay` through a relay client
    #[must_use]
    pub fn peer(&self, relay: PeerId) -> TestPeer {
        let transport = Arc::new(MemoryTransport::new(
            &self.network,
            Identity::generate().peer_id(),
        ));
        let client = RelayClient::new(transport.clone(), relay);
        TestPeer { transport, client }
    }
}

/// A peer without a node of its own
pub struct TestPeer {
    /// Transport endpoint of the peer
    pub transport: Arc<MemoryTransport>,
    /// Client bound to the relay under test
    pub client: RelayClient,
}

impl TestPeer {
    /// Peer id of this endpoint
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Accept the next relayed stream arriving at this peer
    #[must_use]
    pub fn accept_one(&self) -> JoinHandle<RelayedStream> {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let inbound = transport.accept().await.expect("inbound stop stream");
            RelayClient::accept_stop(inbound)
                .await
                .expect("valid stop request")
        })
    }
}
