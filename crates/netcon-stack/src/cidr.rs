use core::fmt;
use core::str::FromStr;
use std::net::IpAddr;

/// An interface address together with its prefix length (e.g. `10.9.0.2/24`).
///
/// Ordering is by address first, then prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpCidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    /// Builds a CIDR, clamping the prefix length to the address family's width.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            addr,
            prefix_len: prefix_len.min(max),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0u32
                } else {
                    u32::MAX << (32 - self.prefix_len as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0u128
                } else {
                    u128::MAX << (128 - self.prefix_len as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCidrError(String);

impl fmt::Display for ParseCidrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR address: {:?}", self.0)
    }
}

impl std::error::Error for ParseCidrError {}

impl FromStr for IpCidr {
    type Err = ParseCidrError;

    /// Parses `addr/prefix`. A bare address gets a host prefix (`/32` or `/128`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCidrError(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| err())?,
            None => max,
        };
        if prefix_len > max {
            return Err(err());
        }
        Ok(Self::new(addr, prefix_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_prefix() {
        let cidr: IpCidr = "10.9.0.2/24".parse().unwrap();
        assert!(cidr.contains("10.9.0.200".parse().unwrap()));
        assert!(!cidr.contains("10.9.1.1".parse().unwrap()));
        assert!(!cidr.contains("fd00::1".parse().unwrap()));
    }

    #[test]
    fn v6_prefix() {
        let cidr: IpCidr = "fd00:1::5/64".parse().unwrap();
        assert!(cidr.contains("fd00:1::99".parse().unwrap()));
        assert!(!cidr.contains("fd00:2::5".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_host_route_and_bad_prefix_fails() {
        let cidr: IpCidr = "10.0.0.1".parse().unwrap();
        assert_eq!(cidr.prefix_len(), 32);
        assert!("10.0.0.1/33".parse::<IpCidr>().is_err());
        assert!("nonsense/8".parse::<IpCidr>().is_err());
    }
}
