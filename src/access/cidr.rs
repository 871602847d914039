//! IPv4 CIDR parsing and containment.

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{AccessError, AccessResult};

/// Compute the netmask for a prefix length. `/0` -> `0`, `/32` -> all ones.
#[inline]
const fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    }
}

/// An IPv4 network in CIDR notation.
///
/// Accepts either a bare address (`"10.0.0.1"`, treated as `/32`) or
/// `"a.b.c.d/N"` with `0 <= N <= 32`. Containment compares addresses as
/// masked 32-bit unsigned integers; the network is masked at construction,
/// so host bits in the input are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    /// Parse a CIDR string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address or prefix length is malformed.
    pub fn parse(s: &str) -> AccessResult<Self> {
        let (ip_str, prefix_len) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let plen: u8 = prefix
                    .parse()
                    .map_err(|_| AccessError::InvalidCidr(s.to_string()))?;
                if plen > 32 {
                    return Err(AccessError::InvalidPrefixLength(plen));
                }
                (ip, plen)
            }
            None => (s, 32),
        };

        let addr: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| AccessError::InvalidCidr(s.to_string()))?;

        let mask = prefix_mask(prefix_len);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    /// Whether `ip` falls inside this network.
    #[inline]
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix_len) == self.network
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The masked network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }
}

impl FromStr for Cidr {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_address_is_slash_32() {
        let cidr = Cidr::parse("192.168.1.1").unwrap();
        assert_eq!(cidr.prefix_len(), 32);
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_parse_network() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(cidr.contains(Ipv4Addr::new(10, 255, 255, 255)));
        assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));
    }

    #[test]
    fn test_host_bits_masked_off() {
        let cidr = Cidr::parse("192.168.1.99/24").unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert!(cidr.contains(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_slash_zero_matches_all() {
        let cidr = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(cidr.contains(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(cidr.contains(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("10.0.0/8").is_err());
        assert!(Cidr::parse("not-an-ip").is_err());
        assert!(Cidr::parse("10.0.0.0/x").is_err());
        assert!(Cidr::parse("256.0.0.1").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let cidr = Cidr::parse("172.16.0.0/12").unwrap();
        assert_eq!(cidr.to_string(), "172.16.0.0/12");
        assert_eq!(Cidr::parse(&cidr.to_string()).unwrap(), cidr);
    }
}
