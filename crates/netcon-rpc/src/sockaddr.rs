use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::Error;

/// Encoded size of a socket address (the size of `sockaddr_in6`).
pub const SOCKADDR_LEN: usize = 28;

pub const AF_UNSPEC: u16 = 0;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// Encodes `addr` in `sockaddr_in` / `sockaddr_in6` layout. `None` encodes as all zeroes
/// (`AF_UNSPEC`).
pub fn encode_sockaddr(addr: Option<SocketAddr>) -> [u8; SOCKADDR_LEN] {
    let mut out = [0u8; SOCKADDR_LEN];
    match addr {
        None => {}
        Some(SocketAddr::V4(v4)) => {
            out[0..2].copy_from_slice(&AF_INET.to_le_bytes());
            out[2..4].copy_from_slice(&v4.port().to_be_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
        }
        Some(SocketAddr::V6(v6)) => {
            out[0..2].copy_from_slice(&AF_INET6.to_le_bytes());
            out[2..4].copy_from_slice(&v6.port().to_be_bytes());
            out[4..8].copy_from_slice(&v6.flowinfo().to_be_bytes());
            out[8..24].copy_from_slice(&v6.ip().octets());
            out[24..28].copy_from_slice(&v6.scope_id().to_le_bytes());
        }
    }
    out
}

pub fn decode_sockaddr(buf: &[u8]) -> Result<Option<SocketAddr>, Error> {
    if buf.len() < SOCKADDR_LEN {
        return Err(Error::AddressTooShort { len: buf.len() });
    }
    let family = u16::from_le_bytes([buf[0], buf[1]]);
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    match family {
        AF_UNSPEC => Ok(None),
        AF_INET => {
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            Ok(Some(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        AF_INET6 => {
            let flowinfo = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[8..24]);
            let scope_id = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
            Ok(Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            ))))
        }
        family => Err(Error::UnknownAddressFamily { family }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_family_decodes_as_none() {
        assert_eq!(decode_sockaddr(&[0u8; SOCKADDR_LEN]).unwrap(), None);
    }

    #[test]
    fn ipv4_layout_matches_sockaddr_in() {
        let addr: SocketAddr = "10.9.0.2:8080".parse().unwrap();
        let enc = encode_sockaddr(Some(addr));
        assert_eq!(&enc[0..2], &[2, 0]);
        assert_eq!(&enc[2..4], &[0x1f, 0x90]);
        assert_eq!(&enc[4..8], &[10, 9, 0, 2]);
        assert_eq!(decode_sockaddr(&enc).unwrap(), Some(addr));
    }

    #[test]
    fn ipv6_keeps_scope_and_port() {
        let addr = SocketAddr::V6(SocketAddrV6::new("fd00::1".parse().unwrap(), 443, 0, 3));
        assert_eq!(decode_sockaddr(&encode_sockaddr(Some(addr))).unwrap(), Some(addr));
    }

    #[test]
    fn rejects_unknown_family() {
        let mut buf = [0u8; SOCKADDR_LEN];
        buf[0] = 1;
        assert_eq!(
            decode_sockaddr(&buf),
            Err(Error::UnknownAddressFamily { family: 1 })
        );
    }
}
