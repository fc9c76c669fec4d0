//! Userspace TCP/IP stack wired to the tunnel
//!
//! Everything here runs under the network's mutex; the driver task and the
//! socket futures take turns polling it.

use std::net::{IpAddr, SocketAddr};

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{dns, tcp};
use smoltcp::time::{Duration as SmolDuration, Instant};
use smoltcp::wire::{DnsQueryType, HardwareAddress, IpAddress, IpCidr, IpEndpoint};
use tracing::{debug, trace};

use crate::cidr::Cidr;
use crate::device::VirtualDevice;
use crate::error::{Error, Result};
use crate::tunnel::PeerTunnel;

const TCP_BUFFER_SIZE: usize = 64 * 1024;
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

pub struct Stack {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    tunnel: PeerTunnel,
    dns: Option<SocketHandle>,
    query_type: DnsQueryType,
    /// Closed by their owners, removed once the connection has wound down
    detached: Vec<SocketHandle>,
    next_port: u16,
}

impl Stack {
    pub fn new(
        addresses: &[Cidr],
        dns_servers: &[IpAddr],
        mtu: u16,
        tunnel: PeerTunnel,
    ) -> Result<Self> {
        let mut device = VirtualDevice::new(mtu);
        let mut config = IfaceConfig::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, Instant::now());

        let mut overflow = false;
        iface.update_ip_addrs(|addrs| {
            for cidr in addresses {
                let ip = IpCidr::new(IpAddress::from(cidr.addr()), cidr.prefix_len());
                overflow |= addrs.push(ip).is_err();
            }
        });
        if overflow {
            return Err(Error::Config("too many interface addresses".into()));
        }

        // Every destination is reached through the tunnel, so the default
        // routes simply point back at our own addresses
        for cidr in addresses {
            let added = match cidr.addr() {
                IpAddr::V4(v4) => iface.routes_mut().add_default_ipv4_route(v4.into()),
                IpAddr::V6(v6) => iface.routes_mut().add_default_ipv6_route(v6.into()),
            };
            added.map_err(|_| Error::Config("route table full".into()))?;
        }

        let mut sockets = SocketSet::new(Vec::new());
        // smoltcp is built for a single DNS server, the first one wins
        let dns = dns_servers.first().map(|server| {
            let servers = [IpAddress::from(*server)];
            let queries: Vec<Option<dns::DnsQuery>> = Vec::new();
            sockets.add(dns::Socket::new(&servers, queries))
        });
        let query_type = if addresses.iter().any(|a| a.addr().is_ipv4()) {
            DnsQueryType::A
        } else {
            DnsQueryType::Aaaa
        };

        let span = EPHEMERAL_PORTS.end() - EPHEMERAL_PORTS.start();
        let next_port = EPHEMERAL_PORTS.start() + rand::random::<u16>() % span;

        Ok(Self {
            iface,
            device,
            sockets,
            tunnel,
            dns,
            query_type,
            detached: Vec::new(),
            next_port,
        })
    }

    pub fn tunnel_mut(&mut self) -> &mut PeerTunnel {
        &mut self.tunnel
    }

    /// Run the TCP/IP stack and seal whatever it wants to send.
    /// Returns datagrams for the peer.
    pub fn poll(&mut self) -> Vec<Vec<u8>> {
        self.iface.poll(Instant::now(), &mut self.device, &mut self.sockets);
        self.reap_detached();

        let mut datagrams = Vec::new();
        while let Some(packet) = self.device.pop_outbound() {
            if let Some(datagram) = self.tunnel.encapsulate(&packet) {
                datagrams.push(datagram);
            }
        }
        datagrams
    }

    /// Feed a datagram from the peer into the tunnel and the stack.
    /// Returns datagrams for the peer.
    pub fn ingest(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let decapsulated = self.tunnel.decapsulate(datagram);
        let mut out = decapsulated.to_network;
        if !decapsulated.to_stack.is_empty() {
            for packet in decapsulated.to_stack {
                self.device.push_inbound(packet);
            }
            out.extend(self.poll());
        }
        out
    }

    /// How long the stack can sleep before it must be polled again
    pub fn poll_delay(&mut self) -> Option<std::time::Duration> {
        self.iface
            .poll_delay(Instant::now(), &self.sockets)
            .map(|d: SmolDuration| std::time::Duration::from_micros(d.total_micros()))
    }

    /// Open a TCP connection; it completes as the stack is polled
    pub fn connect(&mut self, remote: SocketAddr) -> Result<SocketHandle> {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);

        let endpoint = IpEndpoint::new(IpAddress::from(remote.ip()), remote.port());
        let local_port = self.ephemeral_port();
        socket
            .connect(self.iface.context(), endpoint, local_port)
            .map_err(|e| Error::ConnectionFailed {
                address: remote.to_string(),
                reason: format!("{:?}", e),
            })?;
        debug!("Connecting to {} from port {}", remote, local_port);
        Ok(self.sockets.add(socket))
    }

    /// Hand a socket back once its owner is done with it
    pub fn detach(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<tcp::Socket>(handle).close();
        self.detached.push(handle);
    }

    /// Record type matching the interface's address family
    pub fn query_type(&self) -> DnsQueryType {
        self.query_type
    }

    /// Start a DNS query through the tunnel
    pub fn start_query(&mut self, name: &str, query_type: DnsQueryType) -> Result<dns::QueryHandle> {
        let handle = self.dns.ok_or_else(|| Error::Resolve {
            host: name.to_string(),
            reason: "no DNS servers configured".into(),
        })?;
        self.sockets
            .get_mut::<dns::Socket>(handle)
            .start_query(self.iface.context(), name, query_type)
            .map_err(|e| Error::Resolve {
                host: name.to_string(),
                reason: format!("{:?}", e),
            })
    }

    pub fn dns_socket(&mut self) -> Option<&mut dns::Socket<'static>> {
        let handle = self.dns?;
        Some(self.sockets.get_mut::<dns::Socket>(handle))
    }

    pub fn tcp_socket(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket>(handle)
    }

    fn reap_detached(&mut self) {
        let sockets = &mut self.sockets;
        self.detached.retain(|&handle| {
            let state = sockets.get::<tcp::Socket>(handle).state();
            if matches!(state, tcp::State::Closed | tcp::State::TimeWait) {
                trace!("Releasing closed socket ({:?})", state);
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= *EPHEMERAL_PORTS.end() {
            *EPHEMERAL_PORTS.start()
        } else {
            port + 1
        };
        port
    }
}

#[cfg(test)]
impl Stack {
    pub fn add_socket<T: smoltcp::socket::AnySocket<'static>>(&mut self, socket: T) -> SocketHandle {
        self.sockets.add(socket)
    }

    pub fn socket_mut<T: smoltcp::socket::AnySocket<'static>>(&mut self, handle: SocketHandle) -> &mut T {
        self.sockets.get_mut::<T>(handle)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.iter().count()
    }
}
