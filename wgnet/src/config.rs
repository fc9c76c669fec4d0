//! Configuration for wgnet

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use crate::cidr::Cidr;
use crate::crypto::{self, KeyPair};
use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local interface settings
    pub interface: InterfaceConfig,

    /// Configured peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Local interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Friendly name, only used in logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Private key (base64 encoded)
    pub private_key: String,

    /// Addresses of this node on the virtual network (e.g. "10.7.0.2" or "10.7.0.2/32")
    pub addresses: Vec<String>,

    /// DNS servers reachable through the tunnel
    #[serde(default)]
    pub dns_servers: Vec<String>,

    /// MTU of the virtual interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Optional friendly name
    pub name: Option<String>,

    /// Peer's public key (base64 encoded)
    pub public_key: String,

    /// Optional preshared key (base64 encoded)
    pub preshared_key: Option<String>,

    /// Peer's endpoint (host:port)
    pub endpoint: Option<String>,

    /// Networks routed to this peer
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

fn default_name() -> String { "wgnet0".into() }
fn default_mtu() -> u16 { 1420 }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything the network needs before it is built
    pub fn validate(&self) -> Result<()> {
        KeyPair::from_base64(&self.interface.private_key)?;
        if self.interface.addresses.is_empty() {
            return Err(Error::Config("interface needs at least one address".into()));
        }
        self.addresses()?;
        self.dns_servers()?;
        if self.interface.mtu < 576 {
            return Err(Error::Config(format!("MTU {} is too small", self.interface.mtu)));
        }

        let peer = match self.peers.as_slice() {
            [peer] => peer,
            [] => return Err(Error::Config("no peers configured".into())),
            _ => return Err(Error::Config("only a single peer is supported".into())),
        };
        crypto::parse_public_key(&peer.public_key)?;
        if let Some(psk) = &peer.preshared_key {
            crypto::parse_preshared_key(psk)?;
        }
        if peer.endpoint.is_none() {
            return Err(Error::Config(format!("peer {} has no endpoint", peer.display_name())));
        }
        peer.allowed_ips()?;
        Ok(())
    }

    /// The single configured peer
    pub fn peer(&self) -> Result<&PeerConfig> {
        self.peers
            .first()
            .ok_or_else(|| Error::Config("no peers configured".into()))
    }

    /// Parsed interface addresses
    pub fn addresses(&self) -> Result<Vec<Cidr>> {
        self.interface.addresses.iter().map(|a| a.parse()).collect()
    }

    /// Parsed DNS server addresses
    pub fn dns_servers(&self) -> Result<Vec<IpAddr>> {
        self.interface
            .dns_servers
            .iter()
            .map(|s| {
                s.trim().parse().map_err(|_| Error::InvalidAddress {
                    value: s.clone(),
                    reason: "not an IP address".into(),
                })
            })
            .collect()
    }
}

impl PeerConfig {
    /// Parsed allowed IPs
    pub fn allowed_ips(&self) -> Result<Vec<Cidr>> {
        self.allowed_ips.iter().map(|a| a.parse()).collect()
    }

    /// Name for log lines
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.public_key)
    }
}
