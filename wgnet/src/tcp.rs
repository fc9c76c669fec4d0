//! TCP streams over the virtual network

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::State;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::network::Shared;

/// A TCP connection carried through the tunnel.
///
/// Implements Tokio's `AsyncRead` and `AsyncWrite`, so it can be handed to
/// anything that would take a `tokio::net::TcpStream`.
pub struct TcpStream {
    shared: Arc<Shared>,
    handle: SocketHandle,
    peer: SocketAddr,
}

impl TcpStream {
    /// Open a connection and wait for the TCP handshake to finish
    pub(crate) async fn connect(shared: Arc<Shared>, peer: SocketAddr) -> Result<Self> {
        if shared.is_closed() {
            return Err(Error::Closed);
        }
        let handle = shared.lock().connect(peer)?;
        // Constructed before waiting so an abandoned dial still releases the socket
        let stream = TcpStream { shared, handle, peer };
        stream.shared.wake_driver();

        poll_fn(|cx| stream.poll_established(cx)).await?;
        Ok(stream)
    }

    /// Remote address of the connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn poll_established(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(Error::Closed));
        }
        let mut stack = self.shared.lock();
        let socket = stack.tcp_socket(self.handle);
        match socket.state() {
            State::Established | State::CloseWait => Poll::Ready(Ok(())),
            State::SynSent | State::SynReceived => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            state => Poll::Ready(Err(Error::ConnectionFailed {
                address: self.peer.to_string(),
                reason: format!("connection refused ({:?})", state),
            })),
        }
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream").field("peer", &self.peer).finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, Error::Closed)
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        let mut stack = self.shared.lock();
        let socket = stack.tcp_socket(self.handle);

        if socket.can_recv() {
            let n = socket
                .recv_slice(buf.initialize_unfilled())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
            buf.advance(n);
            drop(stack);
            // Freed receive window has to be advertised
            self.shared.wake_driver();
            return Poll::Ready(Ok(()));
        }
        if !socket.may_recv() {
            // EOF
            return Poll::Ready(Ok(()));
        }
        socket.register_recv_waker(cx.waker());
        Poll::Pending
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        let mut stack = self.shared.lock();
        let socket = stack.tcp_socket(self.handle);

        if !socket.may_send() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if socket.can_send() {
            let n = socket
                .send_slice(data)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;
            drop(stack);
            self.shared.wake_driver();
            return Poll::Ready(Ok(n));
        }
        socket.register_send_waker(cx.waker());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.wake_driver();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.lock().tcp_socket(self.handle).close();
        self.shared.wake_driver();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.shared.lock().detach(self.handle);
        self.shared.wake_driver();
    }
}
