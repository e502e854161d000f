//! TCP transport with signed handshakes and dial-back links.
//!
//! Every TCP connection starts with a framed, Ed25519-signed [`Hello`] from
//! the dialer and a signed [`HelloAck`] from the listener. The hello names
//! the dialer's [`PeerId`], the peer it expects to reach, the protocol id and
//! the connection kind:
//!
//! - `Stream`: an ordinary protocol stream, delivered to `accept`.
//! - `Link`: a long-lived control connection from a peer that cannot accept
//!   inbound connections (a browser or a host behind NAT). The listener keeps
//!   it and uses it to ask the peer to dial back whenever it needs a stream.
//! - `DialBack`: the answer to such a request, matched by token.
//!
//! Once the handshake completes the connection carries raw bytes. Encryption
//! is left to the layers above or beneath.

use crate::framing::{read_message, write_message};
use crate::{
    ByteStream, InboundStream, Multiaddr, MultiaddrExt, PeerId, Transport, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use lantern_crypto::{Identity, Signature, verify};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Domain tag mixed into hello signatures
const HELLO_DOMAIN: &str = "lantern-tcp-hello-v1";

/// Domain tag mixed into ack signatures
const ACK_DOMAIN: &str = "lantern-tcp-ack-v1";

/// Depth of the per-link request queue
const LINK_QUEUE: usize = 32;

/// First pause after a failed `accept`
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between failed `accept`s
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause to apply after another consecutive `accept` failure
fn next_accept_backoff(current: Duration) -> Duration {
    (current * 2).clamp(ACCEPT_BACKOFF_MIN, ACCEPT_BACKOFF_MAX)
}

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Time allowed for the hello/ack exchange
    pub handshake_timeout: Duration,
    /// Time allowed to establish a TCP connection or receive a dial-back
    pub dial_timeout: Duration,
    /// Maximum accepted difference between the hello timestamp and local time
    pub max_clock_skew: Duration,
    /// Interval between keepalive pings on idle links
    pub link_keepalive: Duration,
    /// Disable Nagle's algorithm on every connection
    pub nodelay: bool,
    /// Depth of the accept queue
    pub incoming_queue: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            max_clock_skew: Duration::from_secs(300),
            link_keepalive: Duration::from_secs(30),
            nodelay: true,
            incoming_queue: 256,
        }
    }
}

/// Connection kind announced in the hello
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloKind {
    /// Protocol stream
    Stream,
    /// Long-lived dial-back control link
    Link,
    /// Stream answering a dial-back request
    DialBack {
        /// Token from the matching [`LinkFrame::DialBack`]
        token: u64,
    },
}

/// First frame on every connection, sent by the listener
///
/// The dialer signs the nonce into its [`Hello`], so a recorded hello is
/// useless on any other connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    /// Fresh random value for this connection
    pub nonce: [u8; 32],
}

impl Challenge {
    fn fresh() -> Self {
        Self {
            nonce: rand::random(),
        }
    }
}

/// Dialer's answer to the [`Challenge`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Dialer identity
    pub peer: PeerId,
    /// Peer the dialer expects to reach, if known
    pub target: Option<PeerId>,
    /// Protocol id for `Stream` and `DialBack` connections
    pub protocol: String,
    /// Connection kind
    pub kind: HelloKind,
    /// Unix seconds at signing time
    pub timestamp: u64,
    /// Nonce from the listener's challenge
    pub nonce: [u8; 32],
    /// Signature over the fields above
    pub signature: Vec<u8>,
}

impl Hello {
    fn signing_bytes(&self) -> TransportResult<Vec<u8>> {
        bincode::serialize(&(
            HELLO_DOMAIN,
            &self.peer,
            &self.target,
            &self.protocol,
            &self.kind,
            self.timestamp,
            &self.nonce,
        ))
        .map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn signed(
        identity: &Identity,
        target: Option<PeerId>,
        protocol: &str,
        kind: HelloKind,
        challenge: &Challenge,
    ) -> TransportResult<Self> {
        let mut hello = Self {
            peer: identity.peer_id(),
            target,
            protocol: protocol.to_string(),
            kind,
            timestamp: unix_now(),
            nonce: challenge.nonce,
            signature: Vec::new(),
        };
        hello.signature = identity.sign(&hello.signing_bytes()?).to_vec();
        Ok(hello)
    }

    fn verify(&self) -> TransportResult<()> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        verify(&self.peer, &self.signing_bytes()?, &signature)
            .map_err(|e| TransportError::Handshake(format!("hello: {e}")))
    }
}

/// Listener's reply to a [`Hello`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    /// Listener identity
    pub peer: PeerId,
    /// Unix seconds at signing time
    pub timestamp: u64,
    /// Whether the connection was accepted
    pub accepted: bool,
    /// Signature over the fields above, the dialer's id and the challenge
    pub signature: Vec<u8>,
}

impl HelloAck {
    fn signing_bytes(&self, dialer: &PeerId, challenge: &Challenge) -> TransportResult<Vec<u8>> {
        bincode::serialize(&(
            ACK_DOMAIN,
            &self.peer,
            dialer,
            self.timestamp,
            self.accepted,
            &challenge.nonce,
        ))
        .map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn signed(
        identity: &Identity,
        dialer: &PeerId,
        challenge: &Challenge,
        accepted: bool,
    ) -> TransportResult<Self> {
        let mut ack = Self {
            peer: identity.peer_id(),
            timestamp: unix_now(),
            accepted,
            signature: Vec::new(),
        };
        ack.signature = identity
            .sign(&ack.signing_bytes(dialer, challenge)?)
            .to_vec();
        Ok(ack)
    }

    fn verify(&self, dialer: &PeerId, challenge: &Challenge) -> TransportResult<()> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        verify(&self.peer, &self.signing_bytes(dialer, challenge)?, &signature)
            .map_err(|e| TransportError::Handshake(format!("ack: {e}")))
    }
}

/// Frames sent by the listener over a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// Dial back and open a stream for `protocol`
    DialBack {
        /// Token to echo in the dial-back hello
        token: u64,
        /// Protocol id for the new stream
        protocol: String,
    },
    /// Keepalive
    Ping,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// TCP transport
///
/// Cheap to clone; clones share listeners, links and the accept queue.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    identity: Arc<Identity>,
    config: TcpTransportConfig,
    /// Known dialable addresses per peer
    peer_addrs: DashMap<PeerId, Vec<SocketAddr>>,
    /// Links held open by dial-only peers
    links: DashMap<PeerId, mpsc::Sender<LinkFrame>>,
    /// Dial-back requests awaiting the peer's connection
    pending_dialbacks: DashMap<u64, (PeerId, oneshot::Sender<ByteStream>)>,
    incoming_tx: mpsc::Sender<InboundStream>,
    incoming_rx: Mutex<mpsc::Receiver<InboundStream>>,
    closed: CancellationToken,
}

impl TcpTransport {
    /// Create a transport for `identity` with default configuration
    #[must_use]
    pub fn new(identity: Arc<Identity>) -> Self {
        Self::with_config(identity, TcpTransportConfig::default())
    }

    /// Create a transport with custom configuration
    #[must_use]
    pub fn with_config(identity: Arc<Identity>, config: TcpTransportConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_queue.max(1));
        Self {
            inner: Arc::new(TcpInner {
                identity,
                config,
                peer_addrs: DashMap::new(),
                links: DashMap::new(),
                pending_dialbacks: DashMap::new(),
                incoming_tx,
                incoming_rx: Mutex::new(incoming_rx),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Remember a dialable address for `peer`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedAddress`] if `addr` is not a plain
    /// `ip/tcp` address.
    pub fn add_peer_addr(&self, peer: PeerId, addr: &Multiaddr) -> TransportResult<()> {
        let socket = addr
            .tcp_socket_addr()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;
        let mut entry = self.inner.peer_addrs.entry(peer).or_default();
        if !entry.contains(&socket) {
            entry.push(socket);
        }
        Ok(())
    }

    /// Whether `peer` currently holds a link to this transport
    #[must_use]
    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.inner.links.contains_key(peer)
    }

    /// Open a dial-back link to the listener at `addr`
    ///
    /// Used by peers that cannot accept inbound connections. The remote may
    /// then open streams to us by asking over the link; those arrive through
    /// [`Transport::accept`] like any other inbound stream. If `addr` carries
    /// a `/p2p/<id>` suffix the remote must prove that identity.
    ///
    /// # Returns
    /// The authenticated identity of the remote.
    ///
    /// # Errors
    /// Returns an error if the address is not dialable or the handshake fails.
    pub async fn connect_link(&self, addr: &Multiaddr) -> TransportResult<PeerId> {
        let socket = addr
            .tcp_socket_addr()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;

        let (stream, remote) = self
            .inner
            .dial(socket, addr.peer_id(), "", HelloKind::Link)
            .await?;
        self.add_peer_addr(remote, &Multiaddr::from_tcp(socket))?;

        tracing::info!("Link established to {} at {}", remote.short(), socket);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_link_client(stream, socket, remote).await;
        });
        Ok(remote)
    }
}

impl TcpInner {
    fn local_peer(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Connect to `socket` and complete the dialer side of the handshake
    async fn dial(
        &self,
        socket: SocketAddr,
        target: Option<PeerId>,
        protocol: &str,
        kind: HelloKind,
    ) -> TransportResult<(TcpStream, PeerId)> {
        let mut stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(socket))
            .await
            .map_err(|_| TransportError::Timeout("dial"))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{socket}: {e}")))?;
        stream.set_nodelay(self.config.nodelay)?;

        let local = self.local_peer();
        let (challenge, ack): (Challenge, HelloAck) =
            tokio::time::timeout(self.config.handshake_timeout, async {
                let challenge: Challenge = read_message(&mut stream).await?;
                let hello = Hello::signed(&self.identity, target, protocol, kind, &challenge)?;
                write_message(&mut stream, &hello).await?;
                let ack: HelloAck = read_message(&mut stream).await?;
                Ok::<_, TransportError>((challenge, ack))
            })
            .await
            .map_err(|_| TransportError::Timeout("handshake"))??;

        ack.verify(&local, &challenge)?;
        if let Some(expected) = target {
            if ack.peer != expected {
                return Err(TransportError::Handshake(format!(
                    "expected {}, reached {}",
                    expected.short(),
                    ack.peer.short()
                )));
            }
        }
        if !ack.accepted {
            return Err(TransportError::Handshake("rejected by remote".into()));
        }
        Ok((stream, ack.peer))
    }

    fn check_hello(&self, hello: &Hello, challenge: &Challenge) -> TransportResult<()> {
        hello.verify()?;
        if hello.nonce != challenge.nonce {
            return Err(TransportError::Handshake(
                "hello does not answer this connection's challenge".into(),
            ));
        }

        let now = unix_now();
        let skew = now.abs_diff(hello.timestamp);
        if skew > self.config.max_clock_skew.as_secs() {
            return Err(TransportError::Handshake(format!(
                "clock skew of {skew}s"
            )));
        }

        if let Some(target) = hello.target {
            if target != self.local_peer() {
                return Err(TransportError::Handshake(format!(
                    "hello addressed to {}",
                    target.short()
                )));
            }
        }
        if hello.peer == self.local_peer() {
            return Err(TransportError::Handshake("connection to self".into()));
        }
        Ok(())
    }

    /// Listener side of one connection
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> TransportResult<()> {
        stream.set_nodelay(self.config.nodelay)?;

        let challenge = Challenge::fresh();
        let hello: Hello = tokio::time::timeout(self.config.handshake_timeout, async {
            write_message(&mut stream, &challenge).await?;
            read_message(&mut stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout("handshake"))??;

        let verdict = self.check_hello(&hello, &challenge);
        let ack = HelloAck::signed(&self.identity, &hello.peer, &challenge, verdict.is_ok())?;
        write_message(&mut stream, &ack).await?;
        verdict?;

        tracing::trace!(
            "Handshake with {} from {} ({:?})",
            hello.peer.short(),
            remote,
            hello.kind
        );

        match hello.kind {
            HelloKind::Stream => {
                let inbound = InboundStream {
                    peer: hello.peer,
                    protocol: hello.protocol,
                    stream: Box::new(stream),
                };
                self.incoming_tx
                    .send(inbound)
                    .await
                    .map_err(|_| TransportError::Closed)?;
            }
            HelloKind::Link => {
                self.run_link_server(stream, hello.peer).await;
            }
            HelloKind::DialBack { token } => {
                let pending = self
                    .pending_dialbacks
                    .remove_if(&token, |_, (peer, _)| *peer == hello.peer);
                match pending {
                    Some((_, (_, reply))) => {
                        // The requester may have timed out and gone away
                        let _ = reply.send(Box::new(stream));
                    }
                    None => {
                        tracing::debug!(
                            "Unsolicited dial-back from {} (token {})",
                            hello.peer.short(),
                            token
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Hold a link from a dial-only peer until either side closes it
    async fn run_link_server(&self, stream: TcpStream, peer: PeerId) {
        let (tx, mut rx) = mpsc::channel(LINK_QUEUE);
        if self.links.insert(peer, tx.clone()).is_some() {
            tracing::debug!("Replacing existing link from {}", peer.short());
        }
        tracing::info!("Link opened by {}", peer.short());

        let (mut reader, mut writer) = stream.into_split();
        let mut keepalive = tokio::time::interval(self.config.link_keepalive);
        keepalive.tick().await;
        let mut scratch = [0u8; 64];

        loop {
            let frame = tokio::select! {
                () = self.closed.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = keepalive.tick() => LinkFrame::Ping,
                read = reader.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
            };
            if let Err(e) = write_message(&mut writer, &frame).await {
                tracing::debug!("Link to {} failed: {}", peer.short(), e);
                break;
            }
        }

        self.links.remove_if(&peer, |_, sender| sender.same_channel(&tx));
        tracing::info!("Link closed by {}", peer.short());
    }

    /// Serve dial-back requests arriving over a link we opened
    async fn run_link_client(self: Arc<Self>, mut stream: TcpStream, socket: SocketAddr, relay: PeerId) {
        loop {
            let frame: LinkFrame = tokio::select! {
                () = self.closed.cancelled() => break,
                frame = read_message(&mut stream) => match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Link to {} lost: {}", relay.short(), e);
                        break;
                    }
                },
            };

            let LinkFrame::DialBack { token, protocol } = frame else {
                continue;
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                match inner
                    .dial(socket, Some(relay), &protocol, HelloKind::DialBack { token })
                    .await
                {
                    Ok((stream, _)) => {
                        let inbound = InboundStream {
                            peer: relay,
                            protocol,
                            stream: Box::new(stream),
                        };
                        if inner.incoming_tx.send(inbound).await.is_err() {
                            tracing::debug!("Dial-back stream dropped: transport closed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dial-back to {} failed: {}", relay.short(), e);
                    }
                }
            });
        }
    }

    /// Ask a linked peer to dial back for `protocol`
    async fn request_dialback(&self, peer: &PeerId, protocol: &str) -> TransportResult<ByteStream> {
        let link = self
            .links
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::PeerUnreachable(*peer))?;

        let token: u64 = rand::random();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_dialbacks.insert(token, (*peer, reply_tx));

        let request = LinkFrame::DialBack {
            token,
            protocol: protocol.to_string(),
        };
        if link.send(request).await.is_err() {
            self.pending_dialbacks.remove(&token);
            return Err(TransportError::PeerUnreachable(*peer));
        }

        match tokio::time::timeout(self.config.dial_timeout, reply_rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => {
                self.pending_dialbacks.remove(&token);
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.pending_dialbacks.remove(&token);
                Err(TransportError::Timeout("dial-back"))
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Vec<Multiaddr>> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let socket = addr
            .tcp_socket_addr()
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;

        let listener = TcpListener::bind(socket)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{socket}: {e}")))?;
        let bound = listener.local_addr()?;

        tracing::debug!("TCP transport listening on {}", bound);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut backoff = ACCEPT_BACKOFF_MIN;
            loop {
                let accepted = tokio::select! {
                    () = inner.closed.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, remote) = match accepted {
                    Ok(pair) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        pair
                    }
                    Err(e) => {
                        // Persistent failures such as EMFILE must not spin
                        tracing::warn!("Accept failed on {}: {} (retry in {:?})", bound, e, backoff);
                        tokio::select! {
                            () = inner.closed.cancelled() => break,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_accept_backoff(backoff);
                        continue;
                    }
                };

                let conn = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = conn.handle_connection(stream, remote).await {
                        tracing::debug!("Connection from {} rejected: {}", remote, e);
                    }
                });
            }
            tracing::debug!("TCP listener on {} stopped", bound);
        });

        Ok(vec![Multiaddr::from_tcp(bound)])
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> TransportResult<ByteStream> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let addrs = self
            .inner
            .peer_addrs
            .get(peer)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for socket in addrs {
            match self
                .inner
                .dial(socket, Some(*peer), protocol, HelloKind::Stream)
                .await
            {
                Ok((stream, _)) => return Ok(Box::new(stream)),
                Err(e) => {
                    tracing::debug!("Dial {} at {} failed: {}", peer.short(), socket, e);
                }
            }
        }

        self.inner.request_dialback(peer, protocol).await
    }

    async fn accept(&self) -> TransportResult<InboundStream> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            () = self.inner.closed.cancelled() => Err(TransportError::Closed),
            next = incoming.recv() => next.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.closed.cancel();
        self.inner.links.clear();
        self.inner.pending_dialbacks.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn supports(&self, addr: &Multiaddr) -> bool {
        addr.tcp_socket_addr().is_some()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.inner.local_peer())
            .field("links", &self.inner.links.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn loopback() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    async fn listening() -> (TcpTransport, Multiaddr) {
        let transport = TcpTransport::new(Arc::new(Identity::generate()));
        let bound = transport.listen(&loopback()).await.unwrap();
        (transport, bound[0].clone())
    }

    #[test]
    fn test_hello_signature() {
        let identity = Identity::generate();
        let challenge = Challenge::fresh();
        let hello = Hello::signed(&identity, None, "/p/1", HelloKind::Stream, &challenge).unwrap();
        assert!(hello.verify().is_ok());

        let mut tampered = hello.clone();
        tampered.protocol = "/p/2".into();
        assert!(tampered.verify().is_err());

        let mut renonced = hello.clone();
        renonced.nonce = Challenge::fresh().nonce;
        assert!(renonced.verify().is_err());
    }

    #[test]
    fn test_ack_binds_dialer_and_challenge() {
        let listener = Identity::generate();
        let dialer = Identity::generate().peer_id();
        let other = Identity::generate().peer_id();
        let challenge = Challenge::fresh();
        let ack = HelloAck::signed(&listener, &dialer, &challenge, true).unwrap();
        assert!(ack.verify(&dialer, &challenge).is_ok());
        assert!(ack.verify(&other, &challenge).is_err());
        assert!(ack.verify(&dialer, &Challenge::fresh()).is_err());
    }

    #[test]
    fn test_hello_only_answers_its_own_challenge() {
        let transport = TcpTransport::new(Arc::new(Identity::generate()));
        let dialer = Identity::generate();
        let challenge = Challenge::fresh();
        let hello = Hello::signed(
            &dialer,
            Some(transport.local_peer()),
            "/p/1",
            HelloKind::Stream,
            &challenge,
        )
        .unwrap();

        assert!(transport.inner.check_hello(&hello, &challenge).is_ok());
        assert!(matches!(
            transport.inner.check_hello(&hello, &Challenge::fresh()),
            Err(TransportError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_recorded_hello_replay_refused() {
        let (server, addr) = listening().await;
        let socket = addr.tcp_socket_addr().unwrap();
        let dialer = Identity::generate();

        // A hello captured from some earlier connection
        let recorded = Hello::signed(
            &dialer,
            Some(server.local_peer()),
            "/lantern/relay/reserve/1.0.0",
            HelloKind::Stream,
            &Challenge::fresh(),
        )
        .unwrap();

        let mut raw = TcpStream::connect(socket).await.unwrap();
        let _challenge: Challenge = read_message(&mut raw).await.unwrap();
        write_message(&mut raw, &recorded).await.unwrap();
        let ack: HelloAck = read_message(&mut raw).await.unwrap();
        assert!(!ack.accepted);

        let nothing = tokio::time::timeout(Duration::from_millis(200), server.accept()).await;
        assert!(nothing.is_err());
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        let mut delay = ACCEPT_BACKOFF_MIN;
        let mut seen = vec![delay];
        for _ in 0..10 {
            delay = next_accept_backoff(delay);
            seen.push(delay);
        }
        assert_eq!(seen[1], ACCEPT_BACKOFF_MIN * 2);
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*seen.last().unwrap(), ACCEPT_BACKOFF_MAX);
        assert_eq!(next_accept_backoff(Duration::ZERO), ACCEPT_BACKOFF_MIN);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (server, addr) = listening().await;
        let client = TcpTransport::new(Arc::new(Identity::generate()));
        client.add_peer_addr(server.local_peer(), &addr).unwrap();

        let mut out = client
            .open_stream(&server.local_peer(), "/echo/1.0.0")
            .await
            .unwrap();
        let mut inbound = server.accept().await.unwrap();
        assert_eq!(inbound.peer, client.local_peer());
        assert_eq!(inbound.protocol, "/echo/1.0.0");

        out.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_wrong_target_rejected() {
        let (server, addr) = listening().await;
        let client = TcpTransport::new(Arc::new(Identity::generate()));
        let impostor = Identity::generate().peer_id();
        client.add_peer_addr(impostor, &addr).unwrap();

        assert!(client.open_stream(&impostor, "/x").await.is_err());
        drop(server);
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let client = TcpTransport::new(Arc::new(Identity::generate()));
        let nobody = Identity::generate().peer_id();
        assert!(matches!(
            client.open_stream(&nobody, "/x").await,
            Err(TransportError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_dialback_over_link() {
        let (relay, addr) = listening().await;
        let browser = TcpTransport::new(Arc::new(Identity::generate()));

        let remote = browser
            .connect_link(&addr.clone().with_peer(relay.local_peer()))
            .await
            .unwrap();
        assert_eq!(remote, relay.local_peer());

        // Wait for the relay to register the link
        for _ in 0..100 {
            if relay.has_link(&browser.local_peer()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(relay.has_link(&browser.local_peer()));

        let mut out = relay
            .open_stream(&browser.local_peer(), "/lantern/relay/stop/1.0.0")
            .await
            .unwrap();
        let mut inbound = browser.accept().await.unwrap();
        assert_eq!(inbound.peer, relay.local_peer());
        assert_eq!(inbound.protocol, "/lantern/relay/stop/1.0.0");

        out.write_all(b"stop").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stop");
    }

    #[tokio::test]
    async fn test_supports_and_unsupported_listen() {
        let transport = TcpTransport::new(Arc::new(Identity::generate()));
        let quic: Multiaddr = "/ip4/0.0.0.0/udp/9095/quic-v1".parse().unwrap();
        assert!(!transport.supports(&quic));
        assert!(matches!(
            transport.listen(&quic).await,
            Err(TransportError::UnsupportedAddress(_))
        ));
        assert!(transport.supports(&loopback()));
    }

    #[tokio::test]
    async fn test_close_stops_accept() {
        let (server, _addr) = listening().await;
        server.close().await.unwrap();
        assert!(server.is_closed());
        assert!(matches!(server.accept().await, Err(TransportError::Closed)));
    }
}
