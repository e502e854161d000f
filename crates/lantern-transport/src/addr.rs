//! Lantern helpers on top of [`Multiaddr`].
//!
//! Addresses are the standard `multiaddr` type. The relay core treats them as
//! opaque values (equality, ordering in the registry, serialization); only
//! the transports look inside, through [`MultiaddrExt`].
//!
//! A `/p2p/<id>` component carries a Lantern [`PeerId`] as an identity
//! multihash of its 32 key bytes.

use lantern_crypto::PeerId;
use multiaddr::{Multiaddr, Protocol};
use std::net::{IpAddr, SocketAddr};

/// Multihash prefix: identity code, 32-byte digest
const IDENTITY_MULTIHASH_PREFIX: [u8; 2] = [0x00, 0x20];

/// Encode a Lantern peer id for a `/p2p` component
#[must_use]
pub fn p2p_id(peer: &PeerId) -> Option<libp2p_identity::PeerId> {
    let mut bytes = Vec::with_capacity(IDENTITY_MULTIHASH_PREFIX.len() + peer.as_bytes().len());
    bytes.extend_from_slice(&IDENTITY_MULTIHASH_PREFIX);
    bytes.extend_from_slice(peer.as_bytes());
    libp2p_identity::PeerId::from_bytes(&bytes).ok()
}

/// Decode a `/p2p` component back to a Lantern peer id
///
/// Returns `None` for ids that are not a 32-byte identity multihash.
#[must_use]
pub fn lantern_peer(id: &libp2p_identity::PeerId) -> Option<PeerId> {
    let bytes = id.to_bytes();
    let digest = bytes.strip_prefix(&IDENTITY_MULTIHASH_PREFIX[..])?;
    <[u8; 32]>::try_from(digest).ok().map(PeerId::from_bytes)
}

/// Address helpers used by the transports and the node
pub trait MultiaddrExt: Sized {
    /// Address for a TCP socket
    fn from_tcp(addr: SocketAddr) -> Self;

    /// Address for an in-process memory port
    fn memory(port: u64) -> Self;

    /// Trailing `/p2p/<id>` component, if it names a Lantern peer
    fn peer_id(&self) -> Option<PeerId>;

    /// Return the address with its `/p2p` suffix set to `peer`
    ///
    /// An existing suffix is replaced, so applying this twice is a no-op.
    fn with_peer(self, peer: PeerId) -> Self;

    /// Return the address without a trailing `/p2p` suffix
    fn without_peer(self) -> Self;

    /// Socket address if this is a plain `ip/tcp` address, optionally
    /// suffixed with `/p2p/<id>`
    fn tcp_socket_addr(&self) -> Option<SocketAddr>;

    /// Memory port if this is a `/memory/<n>` address
    fn memory_port(&self) -> Option<u64>;

    /// Whether the host component is `0.0.0.0` or `::`
    fn is_unspecified(&self) -> bool;

    /// Whether the address is relayed through another peer
    fn is_circuit(&self) -> bool;

    /// Return the address with its leading IP component replaced by `ip`
    fn with_ip(self, ip: IpAddr) -> Self;
}

impl MultiaddrExt for Multiaddr {
    fn from_tcp(addr: SocketAddr) -> Self {
        Multiaddr::empty()
            .with(Protocol::from(addr.ip()))
            .with(Protocol::Tcp(addr.port()))
    }

    fn memory(port: u64) -> Self {
        Multiaddr::empty().with(Protocol::Memory(port))
    }

    fn peer_id(&self) -> Option<PeerId> {
        match self.iter().last()? {
            Protocol::P2p(id) => lantern_peer(&id),
            _ => None,
        }
    }

    fn with_peer(self, peer: PeerId) -> Self {
        let mut addr = self.without_peer();
        if let Some(id) = p2p_id(&peer) {
            addr.push(Protocol::P2p(id));
        }
        addr
    }

    fn without_peer(mut self) -> Self {
        if matches!(self.iter().last(), Some(Protocol::P2p(_))) {
            self.pop();
        }
        self
    }

    fn tcp_socket_addr(&self) -> Option<SocketAddr> {
        let mut iter = self.iter();
        let ip = match iter.next()? {
            Protocol::Ip4(ip) => IpAddr::V4(ip),
            Protocol::Ip6(ip) => IpAddr::V6(ip),
            _ => return None,
        };
        let port = match iter.next()? {
            Protocol::Tcp(port) => port,
            _ => return None,
        };
        match iter.next() {
            None | Some(Protocol::P2p(_)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    fn memory_port(&self) -> Option<u64> {
        let mut iter = self.iter();
        let port = match iter.next()? {
            Protocol::Memory(port) => port,
            _ => return None,
        };
        match (iter.next(), iter.next()) {
            (None, _) | (Some(Protocol::P2p(_)), None) => Some(port),
            _ => None,
        }
    }

    fn is_unspecified(&self) -> bool {
        match self.iter().next() {
            Some(Protocol::Ip4(ip)) => ip.is_unspecified(),
            Some(Protocol::Ip6(ip)) => ip.is_unspecified(),
            _ => false,
        }
    }

    fn is_circuit(&self) -> bool {
        self.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    fn with_ip(self, ip: IpAddr) -> Self {
        self.iter()
            .enumerate()
            .map(|(index, component)| match component {
                Protocol::Ip4(_) | Protocol::Ip6(_) if index == 0 => Protocol::from(ip),
                other => other,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_display_roundtrip() {
        for text in [
            "/ip4/0.0.0.0/udp/9095/quic-v1",
            "/ip4/0.0.0.0/udp/9095/quic-v1/webtransport",
            "/ip4/0.0.0.0/udp/9096/webrtc-direct",
            "/ip4/127.0.0.1/tcp/9001/ws",
            "/ip6/::1/tcp/9002",
            "/dns4/relay.example.com/tcp/443/wss",
            "/memory/42",
        ] {
            let addr: Multiaddr = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!("ip4/1.2.3.4".parse::<Multiaddr>().is_err());
        assert!("/ip4".parse::<Multiaddr>().is_err());
        assert!("/tcp/notaport".parse::<Multiaddr>().is_err());
        assert!("/carrier-pigeon/1".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn test_tcp_socket_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9002".parse().unwrap();
        assert_eq!(
            addr.tcp_socket_addr(),
            Some("127.0.0.1:9002".parse().unwrap())
        );
        assert_eq!(Multiaddr::from_tcp("127.0.0.1:9002".parse().unwrap()), addr);

        let ws: Multiaddr = "/ip4/127.0.0.1/tcp/9001/ws".parse().unwrap();
        assert_eq!(ws.tcp_socket_addr(), None);

        let quic: Multiaddr = "/ip4/127.0.0.1/udp/9095/quic-v1".parse().unwrap();
        assert_eq!(quic.tcp_socket_addr(), None);
    }

    #[test]
    fn test_memory_port() {
        assert_eq!(Multiaddr::memory(7).memory_port(), Some(7));
        let peer = PeerId::from_bytes([4u8; 32]);
        assert_eq!(Multiaddr::memory(7).with_peer(peer).memory_port(), Some(7));
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert_eq!(tcp.memory_port(), None);
    }

    #[test]
    fn test_peer_suffix() {
        let peer = PeerId::from_bytes([3u8; 32]);
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/9095".parse().unwrap();
        let full = addr.clone().with_peer(peer);
        assert_eq!(full.peer_id(), Some(peer));
        assert_eq!(full.clone().with_peer(peer), full);
        assert_eq!(full.tcp_socket_addr(), addr.tcp_socket_addr());
        assert_eq!(full.clone().without_peer(), addr);

        let reparsed: Multiaddr = full.to_string().parse().unwrap();
        assert_eq!(reparsed, full);
        assert_eq!(reparsed.peer_id(), Some(peer));
    }

    #[test]
    fn test_peer_id_conversion() {
        let peer = PeerId::from_bytes([0xab; 32]);
        let id = p2p_id(&peer).unwrap();
        assert_eq!(lantern_peer(&id), Some(peer));
    }

    #[test]
    fn test_unspecified_and_with_ip() {
        let addr: Multiaddr = "/ip4/0.0.0.0/tcp/9095".parse().unwrap();
        assert!(addr.is_unspecified());
        let local = addr.with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(local.to_string(), "/ip4/127.0.0.1/tcp/9095");
        assert!(!local.is_unspecified());
    }

    #[test]
    fn test_circuit_marker() {
        let addr = "/ip4/1.2.3.4/tcp/9095"
            .parse::<Multiaddr>()
            .unwrap()
            .with_peer(PeerId::from_bytes([9u8; 32]))
            .with(Protocol::P2pCircuit);
        assert!(addr.is_circuit());
        assert_eq!(addr.peer_id(), None);
    }

    #[test]
    fn test_serde_bincode() {
        let addr = Multiaddr::memory(7).with_peer(PeerId::from_bytes([5u8; 32]));
        let bytes = bincode::serialize(&addr).unwrap();
        let decoded: Multiaddr = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }
}
