//! Virtual network handle and its driver task
//!
//! A `Network` owns one UDP socket connected to the peer's endpoint and a
//! background task that shuttles datagrams between that socket, the
//! WireGuard session and the userspace TCP/IP stack. Name resolution and
//! TCP connections are served from the same stack.

use std::future::poll_fn;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;

use smoltcp::socket::dns::{GetQueryResultError, QueryHandle};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::crypto::{self, KeyPair};
use crate::error::{Error, Result};
use crate::stack::Stack;
use crate::tcp::TcpStream;
use crate::tunnel::PeerTunnel;

/// Default upper bound for resolving and connecting in `dial`
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How often boringtun's timers are serviced
const TIMER_INTERVAL: Duration = Duration::from_millis(250);
/// Longest the driver sleeps when nothing is scheduled
const IDLE_POLL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65_536;

/// State shared between the handle, its streams and the driver task
pub(crate) struct Shared {
    stack: Mutex<Stack>,
    notify: Notify,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Stack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the driver to poll the stack again
    pub(crate) fn wake_driver(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Inner {
    name: String,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn shutdown(&self) -> bool {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.closed.store(true, Ordering::Release);
        match handle {
            Some(driver) => {
                driver.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a userspace WireGuard network.
///
/// Cheap to clone; the tunnel stays up until `close` is called or the last
/// clone is dropped.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

impl Network {
    /// Bring the network up: resolve the peer, open the UDP socket, start
    /// the handshake and spawn the driver task.
    pub async fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let keys = KeyPair::from_base64(&config.interface.private_key)?;
        let peer = config.peer()?;
        let endpoint_str = peer
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config(format!("peer {} has no endpoint", peer.display_name())))?;
        let endpoint = resolve_endpoint(endpoint_str).await?;

        let peer_public = crypto::parse_public_key(&peer.public_key)?;
        let preshared_key = peer
            .preshared_key
            .as_deref()
            .map(crypto::parse_preshared_key)
            .transpose()?;
        let tunnel = PeerTunnel::new(
            keys.secret,
            peer_public,
            preshared_key,
            peer.persistent_keepalive,
            endpoint,
            peer.allowed_ips()?,
        )?;
        let mut stack = Stack::new(
            &config.addresses()?,
            &config.dns_servers()?,
            config.interface.mtu,
            tunnel,
        )?;

        let bind: SocketAddr = match endpoint {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(endpoint).await?;

        if let Some(initiation) = stack.tunnel_mut().handshake(false) {
            if let Err(e) = socket.send(&initiation).await {
                warn!("Failed to send handshake initiation to {}: {}", endpoint, e);
            }
        }

        let shared = Arc::new(Shared {
            stack: Mutex::new(stack),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive(Arc::clone(&shared), socket));

        info!(
            "{}: tunnel to {} ({}) via {}",
            config.interface.name,
            peer.display_name(),
            endpoint,
            config.interface.addresses.join(", ")
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.interface.name.clone(),
                shared,
                driver: Mutex::new(Some(driver)),
            }),
        })
    }

    /// Interface name from the configuration
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Resolve a host name using the DNS servers behind the tunnel.
    /// IP literals are returned as is.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return Err(Error::Closed);
        }

        let handle = {
            let mut stack = shared.lock();
            let query_type = stack.query_type();
            stack.start_query(host, query_type)?
        };
        let mut query = PendingQuery {
            shared,
            handle,
            done: false,
        };
        shared.wake_driver();
        debug!("Resolving {} through the tunnel", host);

        poll_fn(|cx| {
            if query.shared.is_closed() {
                return Poll::Ready(Err(Error::Closed));
            }
            let mut stack = query.shared.lock();
            let Some(socket) = stack.dns_socket() else {
                return Poll::Ready(Err(Error::Closed));
            };
            match socket.get_query_result(query.handle) {
                Ok(addrs) => {
                    query.done = true;
                    Poll::Ready(
                        addrs
                            .iter()
                            .next()
                            .map(|addr| IpAddr::from(*addr))
                            .ok_or_else(|| Error::Resolve {
                                host: host.to_string(),
                                reason: "no addresses returned".into(),
                            }),
                    )
                }
                Err(GetQueryResultError::Pending) => {
                    socket.register_query_waker(query.handle, cx.waker());
                    Poll::Pending
                }
                Err(GetQueryResultError::Failed) => {
                    query.done = true;
                    Poll::Ready(Err(Error::Resolve {
                        host: host.to_string(),
                        reason: "query failed".into(),
                    }))
                }
            }
        })
        .await
    }

    /// Connect to `host:port` through the tunnel with the default timeout
    pub async fn dial(&self, address: &str) -> Result<TcpStream> {
        self.dial_timeout(address, DEFAULT_DIAL_TIMEOUT).await
    }

    /// Connect to `host:port` through the tunnel. The timeout covers both
    /// name resolution and the TCP handshake.
    pub async fn dial_timeout(&self, address: &str, timeout: Duration) -> Result<TcpStream> {
        let (host, port) = split_host_port(address)?;
        let connect = async {
            let ip = self.resolve(host).await?;
            let remote = SocketAddr::new(ip, port);
            let stream = TcpStream::connect(Arc::clone(&self.inner.shared), remote).await?;
            debug!("Connected to {} ({})", address, remote);
            Ok(stream)
        };
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Stop the driver task. Streams opened from this network fail from
    /// now on. Calling it again is a no-op.
    pub fn close(&self) {
        if self.inner.shutdown() {
            info!("{}: closed", self.inner.name);
        }
    }
}

/// Cancels an unfinished DNS query when its future is dropped
struct PendingQuery<'a> {
    shared: &'a Shared,
    handle: QueryHandle,
    done: bool,
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut stack = self.shared.lock();
        if let Some(socket) = stack.dns_socket() {
            socket.cancel_query(self.handle);
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let invalid = |reason: &str| Error::InvalidAddress {
        value: address.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port = port.parse().map_err(|_| invalid("invalid port"))?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    Ok((host, port))
}

/// Resolve the peer's endpoint with the host resolver, preferring IPv4
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| Error::Endpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Endpoint {
            endpoint: endpoint.to_string(),
            reason: "no addresses found".into(),
        })
}

async fn send_all(socket: &UdpSocket, datagrams: Vec<Vec<u8>>) {
    for datagram in datagrams {
        if let Err(e) = socket.send(&datagram).await {
            debug!("UDP send failed: {}", e);
        }
    }
}

/// Driver loop, runs until aborted
async fn drive(shared: Arc<Shared>, socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut timers = tokio::time::interval(TIMER_INTERVAL);
    timers.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let (outbound, delay) = {
            let mut stack = shared.lock();
            (stack.poll(), stack.poll_delay())
        };
        send_all(&socket, outbound).await;
        let delay = delay.map_or(IDLE_POLL, |d| d.min(IDLE_POLL));

        let outbound = tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(n) => {
                    trace!("Received {} byte datagram", n);
                    let mut stack = shared.lock();
                    stack.ingest(&buf[..n])
                }
                Err(e) => {
                    debug!("UDP receive failed: {}", e);
                    Vec::new()
                }
            },
            _ = timers.tick() => {
                let mut stack = shared.lock();
                stack.tunnel_mut().update_timers().into_iter().collect()
            }
            _ = tokio::time::sleep(delay) => Vec::new(),
            _ = shared.notify.notified() => Vec::new(),
        };
        send_all(&socket, outbound).await;
    }
}
