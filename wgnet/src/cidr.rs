//! IP networks in CIDR notation
//!
//! Used for interface addresses and for a peer's allowed IPs.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;

/// An IP network, e.g. `10.7.0.0/24`. A bare address is a host route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Create a network, rejecting prefix lengths longer than the address
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        (prefix_len <= max_prefix(&addr)).then_some(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check whether an address falls inside this network.
    /// Addresses of the other family never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix_len);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix_len);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidAddress {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid("not an IP address"))?;
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid("bad prefix length"))?,
            None => max_prefix(&addr),
        };
        Cidr::new(addr, prefix_len).ok_or_else(|| invalid("prefix length too long"))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_u32(prefix_len: u8) -> u32 {
    u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0)
}

fn mask_u128(prefix_len: u8) -> u128 {
    u128::MAX.checked_shl(128 - prefix_len as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let net: Cidr = "10.7.0.0/24".parse().unwrap();
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.to_string(), "10.7.0.0/24");

        let host: Cidr = "10.7.0.2".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);

        let v6: Cidr = "fd00::1".parse().unwrap();
        assert_eq!(v6.prefix_len(), 128);

        assert!("10.7.0.0/33".parse::<Cidr>().is_err());
        assert!("web/24".parse::<Cidr>().is_err());
        assert!("10.7.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_contains() {
        let net: Cidr = "10.7.0.0/24".parse().unwrap();
        assert!(net.contains(&"10.7.0.1".parse().unwrap()));
        assert!(!net.contains(&"10.7.1.1".parse().unwrap()));
        assert!(!net.contains(&"fd00::1".parse().unwrap()));

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(&"172.18.0.3".parse().unwrap()));

        let any6: Cidr = "::/0".parse().unwrap();
        assert!(any6.contains(&"fd00::1".parse().unwrap()));
        assert!(!any6.contains(&"10.7.0.1".parse().unwrap()));
    }
}
