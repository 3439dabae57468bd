use std::net::Ipv4Addr;

use super::checksum::ipv4_header_checksum;
use super::{ensure_len, PacketError};

pub struct Ipv4Protocol;

impl Ipv4Protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Packet<'a> {
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub const HEADER_LEN: usize = 20;

    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, Self::HEADER_LEN)?;
        let version = buf[0] >> 4;
        let ihl = (buf[0] & 0x0f) as usize;
        if version != 4 || ihl < 5 {
            return Err(PacketError::Malformed("invalid IPv4 header"));
        }
        let header_len = ihl * 4;
        ensure_len(buf, header_len)?;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(buf, total_len)?;
        if ipv4_header_checksum(&buf[..header_len]) != 0 {
            return Err(PacketError::Malformed("bad IPv4 header checksum"));
        }

        Ok(Self {
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags_fragment: u16::from_be_bytes([buf[6], buf[7]]),
            ttl: buf[8],
            protocol: buf[9],
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            payload: &buf[header_len..total_len],
        })
    }

    /// True when this packet is a fragment (more-fragments set or a nonzero offset).
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & 0x3fff != 0
    }

    pub fn serialize(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        identification: u16,
        ttl: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = Self::HEADER_LEN + payload.len();
        let mut out = vec![0u8; Self::HEADER_LEN];
        out[0] = (4u8 << 4) | 5;
        out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&identification.to_be_bytes());
        out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
        out[8] = ttl;
        out[9] = protocol;
        out[12..16].copy_from_slice(&src.octets());
        out[16..20].copy_from_slice(&dst.octets());
        let csum = ipv4_header_checksum(&out);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}
