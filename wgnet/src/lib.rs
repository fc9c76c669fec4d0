//! wgnet - Userspace WireGuard networking for Tokio
//!
//! Joins a WireGuard network without a kernel interface or elevated
//! privileges: packets are encrypted by boringtun, carried over an ordinary
//! UDP socket and terminated in an embedded smoltcp TCP/IP stack. Streams
//! dialed through a `Network` implement Tokio's `AsyncRead`/`AsyncWrite`.

pub mod cidr;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;

mod device;
mod stack;
mod tcp;
mod tunnel;

pub use cidr::Cidr;
pub use config::Config;
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use network::{Network, DEFAULT_DIAL_TIMEOUT};
pub use tcp::TcpStream;
