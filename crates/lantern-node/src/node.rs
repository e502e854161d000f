//! Node implementation - lifecycle coordinator
//!
//! The node owns every long-lived component: the address registry, the
//! relay service (and through it the reservation table and live circuits),
//! the discovery publisher and the background tasks that drive them.
//!
//! Startup order:
//!
//! 1. Bind listeners and populate the address registry
//! 2. Start the inbound dispatcher and the reservation sweeper
//! 3. Link gossip neighbours, join the discovery topic, start the heartbeat
//! 4. Publish the initial announcement
//!
//! Shutdown reverses it: stop admitting relay work, give in-flight circuits
//! the grace period, force-close the rest, leave the topic, cancel the
//! background tasks and close the transport.
//!
//! # Example
//!
//! ```no_run
//! use lantern_crypto::Identity;
//! use lantern_node::{Node, NodeConfig};
//! use lantern_transport::TcpTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = Arc::new(Identity::generate());
//!     let transport = Arc::new(TcpTransport::new(identity.clone()));
//!     let node = Node::new(identity, transport, NodeConfig::default())?;
//!
//!     node.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use dashmap::DashMap;
use lantern_crypto::{Identity, PeerId};
use lantern_discovery::{DiscoveryPublisher, FloodTopic, Topic};
use lantern_relay::{CloseReason, RelayService};
use lantern_transport::{
    AddressRegistry, InboundStream, Multiaddr, MultiaddrExt, Protocol, ProtocolHandler, Transport,
    TransportError,
};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Node inner state
struct NodeInner {
    /// Long-term identity
    identity: Arc<Identity>,
    /// Node configuration
    config: NodeConfig,
    /// Stream transport every component shares
    transport: Arc<dyn Transport>,
    /// Our advertised addresses
    registry: AddressRegistry,
    /// Relay protocol handler, reservation table and circuits
    relay: RelayService,
    /// Flood gossip, when the node built its own topic
    gossip: Option<FloodTopic>,
    /// Discovery publisher, when discovery is enabled
    discovery: Option<DiscoveryPublisher>,
    /// Protocol id -> handler
    handlers: DashMap<String, Arc<dyn ProtocolHandler>>,
    /// Node running state
    running: AtomicBool,
    /// Root of the cancellation tree (node -> relay -> circuit)
    cancel: CancellationToken,
    /// Background tasks joined on shutdown
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Lantern relay node
///
/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node on `transport`
    ///
    /// When discovery is enabled the node floods the discovery topic across
    /// its configured neighbours over the same transport.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` does not validate or
    /// `identity` does not match the transport's local peer.
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> NodeResult<Self> {
        let gossip = config
            .discovery_enabled
            .then(|| FloodTopic::new(Arc::clone(&transport), config.discovery.topic.clone()));
        let topic = gossip
            .clone()
            .map(|flood| Arc::new(flood) as Arc<dyn Topic>);
        Self::build(identity, transport, config, gossip, topic)
    }

    /// Create a node publishing discovery announcements on `topic`
    ///
    /// # Errors
    ///
    /// Same as [`Node::new`].
    pub fn with_topic(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        topic: Arc<dyn Topic>,
        config: NodeConfig,
    ) -> NodeResult<Self> {
        let topic = config.discovery_enabled.then_some(topic);
        Self::build(identity, transport, config, None, topic)
    }

    fn build(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
        gossip: Option<FloodTopic>,
        topic: Option<Arc<dyn Topic>>,
    ) -> NodeResult<Self> {
        config.validate()?;
        if identity.peer_id() != transport.local_peer() {
            return Err(NodeError::invalid_config(
                "identity does not match the transport's local peer",
            ));
        }

        let cancel = CancellationToken::new();
        let registry = AddressRegistry::new();
        let relay = RelayService::with_parent(Arc::clone(&transport), config.relay.clone(), &cancel);
        let discovery = topic.map(|topic| {
            DiscoveryPublisher::new(
                Arc::clone(&identity),
                topic,
                registry.clone(),
                config.discovery.clone(),
            )
        });

        let node = Self {
            inner: Arc::new(NodeInner {
                identity,
                config,
                transport,
                registry,
                relay: relay.clone(),
                gossip: gossip.clone(),
                discovery,
                handlers: DashMap::new(),
                running: AtomicBool::new(false),
                cancel,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        node.register_handler(Arc::new(relay));
        if let Some(gossip) = gossip {
            node.register_handler(Arc::new(gossip));
        }
        Ok(node)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// Long-term identity
    #[must_use]
    pub fn identity(&self) -> &Arc<Identity> {
        &self.inner.identity
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Transport shared by every component
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Advertised addresses
    #[must_use]
    pub fn registry(&self) -> &AddressRegistry {
        &self.inner.registry
    }

    /// Advertised addresses with our `/p2p/<id>` suffix
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.registry.with_peer(self.peer_id())
    }

    /// Relay service
    #[must_use]
    pub fn relay(&self) -> &RelayService {
        &self.inner.relay
    }

    /// Discovery publisher, if discovery is enabled
    #[must_use]
    pub fn discovery(&self) -> Option<&DiscoveryPublisher> {
        self.inner.discovery.as_ref()
    }

    /// Flood gossip topic, if the node built one
    #[must_use]
    pub fn gossip(&self) -> Option<&FloodTopic> {
        self.inner.gossip.as_ref()
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Route inbound streams for `handler`'s protocols to it
    ///
    /// A later registration for the same protocol id replaces the earlier.
    pub fn register_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        for protocol in handler.protocols() {
            tracing::debug!("Registered handler for {}", protocol);
            self.inner
                .handlers
                .insert(protocol.to_string(), Arc::clone(&handler));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the node
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the node is already running or
    /// has been stopped, and `NodeError::Bind` if none of the configured
    /// listen addresses could be bound. Discovery failures are logged and do
    /// not fail startup.
    pub async fn start(&self) -> NodeResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(NodeError::invalid_state("Node has been shut down"));
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node already running"));
        }

        if let Err(e) = self.bring_up_listeners().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let peer = self.peer_id();
        tracing::info!("PeerID: {}", peer);
        for addr in self.listen_addrs() {
            tracing::info!("Listening on: {}", addr);
        }

        let dispatcher = {
            let node = self.clone();
            tokio::spawn(async move { node.dispatch_loop().await })
        };
        let sweeper = self
            .inner
            .relay
            .spawn_sweeper(self.inner.cancel.child_token());
        self.track(dispatcher);
        self.track(sweeper);

        self.start_discovery().await;

        tracing::info!("Node started: {}", peer.short());
        Ok(())
    }

    async fn bring_up_listeners(&self) -> NodeResult<()> {
        let transport = &self.inner.transport;
        let mut bound = Vec::new();

        for addr in &self.inner.config.listen {
            if !transport.supports(addr) {
                tracing::warn!("Skipping unsupported listen address {}", addr);
                continue;
            }
            match transport.listen(addr).await {
                Ok(addrs) => bound.extend(addrs),
                Err(e) => tracing::warn!("Failed to listen on {}: {}", addr, e),
            }
        }

        if bound.is_empty() {
            return Err(NodeError::bind("no configured listen address could be bound"));
        }

        let advertised = if self.inner.config.announce.is_empty() {
            bound.into_iter().map(loopback_if_unspecified).collect()
        } else {
            self.inner.config.announce.clone()
        };
        self.inner.registry.replace(advertised);
        Ok(())
    }

    async fn start_discovery(&self) {
        let Some(publisher) = &self.inner.discovery else {
            return;
        };

        if let Some(gossip) = &self.inner.gossip {
            for peer in &self.inner.config.neighbours {
                match gossip.add_neighbour(*peer).await {
                    Ok(()) => tracing::info!("Linked gossip neighbour {}", peer.short()),
                    Err(e) => tracing::warn!("Failed to link neighbour {}: {}", peer.short(), e),
                }
            }
        }

        if let Err(e) = publisher.join() {
            tracing::warn!("Failed to join discovery topic: {}", e);
            return;
        }

        let heartbeat = {
            let publisher = publisher.clone();
            let cancel = self.inner.cancel.child_token();
            tokio::spawn(async move { publisher.run(cancel).await })
        };
        self.track(heartbeat);

        match publisher.publish().await {
            Ok(announcement) => tracing::info!(
                "Published initial announcement (seq {}, {} addresses)",
                announcement.sequence,
                announcement.addrs.len()
            ),
            Err(e) => tracing::warn!("Initial announcement failed: {}", e),
        }
    }

    /// Stop the node
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the node is not running.
    pub async fn stop(&self) -> NodeResult<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node not running"));
        }
        tracing::info!("Stopping node {}", self.peer_id().short());

        let relay = &self.inner.relay;
        relay.stop_accepting();

        let forwarder = relay.forwarder();
        if !forwarder.is_empty() {
            tracing::info!(
                "Draining {} circuits (grace {:?})",
                forwarder.len(),
                self.inner.config.shutdown_grace
            );
        }
        if !forwarder.drain(self.inner.config.shutdown_grace).await {
            let closed = forwarder.close_all(CloseReason::Shutdown);
            tracing::warn!("Grace period elapsed, force-closed {} circuits", closed);
            forwarder.drain(self.inner.config.relay.teardown_timeout).await;
        }

        if let Some(publisher) = &self.inner.discovery {
            publisher.leave().await;
        }
        if let Some(gossip) = &self.inner.gossip {
            gossip.close();
        }

        self.inner.cancel.cancel();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::warn!("Background task panicked: {}", e);
                }
            }
        }

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }

        tracing::info!("Node stopped");
        Ok(())
    }

    /// Start, wait for `signal`, then stop
    ///
    /// # Errors
    ///
    /// Returns the first error from [`Node::start`] or [`Node::stop`].
    pub async fn run_until<F>(&self, signal: F) -> NodeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        tracing::info!("Shutdown requested");
        self.stop().await
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inbound Dispatch
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    async fn dispatch_loop(self) {
        loop {
            let accepted = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                accepted = self.inner.transport.accept() => accepted,
            };
            match accepted {
                Ok(inbound) => self.dispatch(inbound),
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    if self.inner.transport.is_closed() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Inbound dispatcher stopped");
    }

    fn dispatch(&self, inbound: InboundStream) {
        let handler = self
            .inner
            .handlers
            .get(&inbound.protocol)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                tokio::spawn(async move { handler.handle(inbound).await });
            }
            None => {
                tracing::debug!(
                    "No handler for {} from {}, closing stream",
                    inbound.protocol,
                    inbound.peer.short()
                );
            }
        }
    }
}

/// `0.0.0.0`/`::` are not dialable; advertise loopback instead
fn loopback_if_unspecified(addr: Multiaddr) -> Multiaddr {
    if !addr.is_unspecified() {
        return addr;
    }
    let loopback = match addr.iter().next() {
        Some(Protocol::Ip6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    addr.with_ip(loopback)
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer", &self.peer_id())
            .field("running", &self.is_running())
            .field("addrs", &self.inner.registry.snapshot())
            .finish_non_exhaustive()
    }
}
