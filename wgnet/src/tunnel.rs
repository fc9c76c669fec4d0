//! WireGuard tunnel to the single configured peer
//!
//! Thin wrapper over `boringtun::noise::Tunn` that turns its borrowed
//! results into owned packets and applies the peer's allowed IPs.

use std::net::{IpAddr, SocketAddr};

use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use tracing::{debug, trace};

use crate::cidr::Cidr;
use crate::device;
use crate::error::{Error, Result};

/// Largest datagram or packet we ever hand to boringtun
const BUFFER_SIZE: usize = 65_536;

/// Output of feeding one datagram into the tunnel
#[derive(Debug, Default)]
pub struct Decapsulated {
    /// Datagrams to send back to the peer (handshake replies, queued packets)
    pub to_network: Vec<Vec<u8>>,
    /// Decrypted IP packets for the local stack
    pub to_stack: Vec<Vec<u8>>,
}

/// Session with the peer
pub struct PeerTunnel {
    tunn: Tunn,
    endpoint: SocketAddr,
    allowed_ips: Vec<Cidr>,
    buf: Vec<u8>,
}

impl PeerTunnel {
    pub fn new(
        secret: StaticSecret,
        peer_public: PublicKey,
        preshared_key: Option<[u8; 32]>,
        persistent_keepalive: Option<u16>,
        endpoint: SocketAddr,
        allowed_ips: Vec<Cidr>,
    ) -> Result<Self> {
        let index = rand::random::<u32>() >> 8;
        let tunn = Tunn::new(secret, peer_public, preshared_key, persistent_keepalive, index, None)
            .map_err(|e| Error::Config(format!("cannot set up tunnel to {}: {}", endpoint, e)))?;
        Ok(Self {
            tunn,
            endpoint,
            allowed_ips,
            buf: vec![0u8; BUFFER_SIZE],
        })
    }

    /// Whether traffic for this address may go through the tunnel
    pub fn routes(&self, ip: &IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(ip))
    }

    /// Build a handshake initiation datagram
    pub fn handshake(&mut self, force: bool) -> Option<Vec<u8>> {
        match self.tunn.format_handshake_initiation(&mut self.buf, force) {
            TunnResult::WriteToNetwork(datagram) => Some(datagram.to_vec()),
            TunnResult::Err(e) => {
                debug!("Handshake initiation failed: {:?}", e);
                None
            }
            _ => None,
        }
    }

    /// Encrypt an outbound IP packet. Packets outside the allowed IPs are
    /// dropped; without a session boringtun queues the packet and returns
    /// a handshake initiation instead.
    pub fn encapsulate(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        match device::get_dest_ip(packet) {
            Some(dst) if self.routes(&dst) => {}
            dst => {
                trace!("Dropping outbound packet to {:?}: not in allowed IPs", dst);
                return None;
            }
        }
        match self.tunn.encapsulate(packet, &mut self.buf) {
            TunnResult::WriteToNetwork(datagram) => Some(datagram.to_vec()),
            TunnResult::Err(e) => {
                debug!("Encapsulation failed: {:?}", e);
                None
            }
            _ => None,
        }
    }

    /// Process a datagram received from the peer
    pub fn decapsulate(&mut self, datagram: &[u8]) -> Decapsulated {
        let mut out = Decapsulated::default();
        let src = Some(self.endpoint.ip());

        let flush = match self.tunn.decapsulate(src, datagram, &mut self.buf) {
            TunnResult::WriteToNetwork(reply) => {
                out.to_network.push(reply.to_vec());
                true
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                let packet = packet.to_vec();
                match device::get_src_ip(&packet) {
                    Some(ip) if self.routes(&ip) => out.to_stack.push(packet),
                    ip => trace!("Dropping inbound packet from {:?}: not in allowed IPs", ip),
                }
                false
            }
            TunnResult::Done => false,
            TunnResult::Err(e) => {
                debug!("Dropping datagram from {}: {:?}", self.endpoint, e);
                false
            }
        };

        // After a handshake boringtun hands back the packets it queued, one per call
        if flush {
            while let TunnResult::WriteToNetwork(queued) =
                self.tunn.decapsulate(None, &[], &mut self.buf)
            {
                out.to_network.push(queued.to_vec());
            }
        }
        out
    }

    /// Drive handshake retries, rekeying and keepalives
    pub fn update_timers(&mut self) -> Option<Vec<u8>> {
        match self.tunn.update_timers(&mut self.buf) {
            TunnResult::WriteToNetwork(datagram) => Some(datagram.to_vec()),
            TunnResult::Err(e) => {
                debug!("Tunnel timer error for {}: {:?}", self.endpoint, e);
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn pair() -> (PeerTunnel, PeerTunnel) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let any: Vec<Cidr> = vec!["0.0.0.0/0".parse().unwrap()];
        let left = PeerTunnel::new(
            a.secret,
            b.public,
            None,
            None,
            "127.0.0.1:51820".parse().unwrap(),
            any.clone(),
        )
        .unwrap();
        let right = PeerTunnel::new(
            b.secret,
            a.public,
            None,
            None,
            "127.0.0.1:51821".parse().unwrap(),
            any,
        )
        .unwrap();
        (left, right)
    }

    /// Minimal IPv4 packet with a consistent total length field
    fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn test_handshake_and_transfer() {
        let (mut left, mut right) = pair();

        let init = left.handshake(false).expect("initiation");
        let response = right.decapsulate(&init);
        assert_eq!(response.to_network.len(), 1);
        assert!(response.to_stack.is_empty());

        // The initiator confirms the session with a keepalive
        let confirm = left.decapsulate(&response.to_network[0]);
        for datagram in &confirm.to_network {
            right.decapsulate(datagram);
        }

        let packet = ipv4_packet([10, 7, 0, 2], [10, 7, 0, 1], b"hello");
        let sealed = left.encapsulate(&packet).expect("sealed packet");
        assert_ne!(sealed, packet);

        let opened = right.decapsulate(&sealed);
        assert_eq!(opened.to_stack, vec![packet]);
    }

    #[test]
    fn test_allowed_ips_filter() {
        let keys = KeyPair::generate();
        let peer = KeyPair::generate();
        let mut tunnel = PeerTunnel::new(
            keys.secret,
            peer.public,
            None,
            None,
            "127.0.0.1:51820".parse().unwrap(),
            vec!["10.7.0.0/24".parse().unwrap()],
        )
        .unwrap();
        assert!(tunnel.routes(&"10.7.0.1".parse().unwrap()));
        assert!(!tunnel.routes(&"192.168.1.1".parse().unwrap()));

        let outside = ipv4_packet([10, 7, 0, 2], [192, 168, 1, 1], b"x");
        assert!(tunnel.encapsulate(&outside).is_none());
        assert!(tunnel.encapsulate(&[0xff; 4]).is_none());

        // Without a session the packet is queued behind a handshake initiation
        let inside = ipv4_packet([10, 7, 0, 2], [10, 7, 0, 1], b"x");
        assert!(tunnel.encapsulate(&inside).is_some());
    }
}
