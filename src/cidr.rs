//! `address/prefix-length` codec.
//!
//! A bare address is never read as a /32: the prefix length must always be
//! spelled out, and it is always written back out.

use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{CniError, Result};

/// An IPv4 address paired with a prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Cidr {
    /// Pair an address with a prefix length in [0, 32]
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(CniError::invalid_cidr(
                format!("{}/{}", address, prefix_len),
                "prefix length must be between 0 and 32",
            ));
        }
        Ok(Self { address, prefix_len })
    }

    /// Parse `a.b.c.d/len`, splitting on the last `/`
    pub fn parse(text: &str) -> Result<Self> {
        let (addr, prefix) = text
            .rsplit_once('/')
            .ok_or_else(|| CniError::invalid_cidr(text, "missing '/'"))?;

        let address = Ipv4Addr::from_str(addr)
            .map_err(|_| CniError::invalid_cidr(text, format!("invalid IPv4 address '{}'", addr)))?;

        let prefix_len = prefix
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| CniError::invalid_cidr(text, format!("invalid prefix length '{}'", prefix)))?;

        Ok(Self { address, prefix_len })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Same address, different prefix length
    pub fn with_prefix(&self, prefix_len: u8) -> Result<Self> {
        Self::new(self.address, prefix_len)
    }

    /// Network mask for the prefix length
    pub fn mask(&self) -> Ipv4Addr {
        self.as_network().mask()
    }

    /// Address with the host bits cleared
    pub fn network(&self) -> Ipv4Addr {
        self.as_network().network()
    }

    /// Address advanced by `hosts`. Wraps at the top of the address space.
    pub fn offset(&self, hosts: u32) -> Self {
        Self {
            address: Ipv4Addr::from(u32::from(self.address).wrapping_add(hosts)),
            prefix_len: self.prefix_len,
        }
    }

    /// Whether `addr` lies within this CIDR's network
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.as_network().contains(addr)
    }

    fn as_network(&self) -> Ipv4Network {
        // prefix_len is validated on construction
        Ipv4Network::new(self.address, self.prefix_len)
            .unwrap_or_else(|_| Ipv4Network::from(self.address))
    }
}

/// Render `address/prefix_len`, always including the prefix
pub fn serialize(address: Ipv4Addr, prefix_len: u8) -> String {
    format!("{}/{}", address, prefix_len)
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self.address, self.prefix_len))
    }
}

impl FromStr for Cidr {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self> {
        Cidr::parse(s)
    }
}
