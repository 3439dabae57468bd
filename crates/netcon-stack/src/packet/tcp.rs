use std::net::Ipv4Addr;

use super::{checksum, ensure_len, PacketError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self { data, header_len })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn seq_number(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn flags(&self) -> TcpFlags {
        let ns = (self.data[12] & 0x01) as u16;
        TcpFlags((ns << 8) | self.data[13] as u16)
    }

    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }

    /// Maximum segment size advertised in the options, if any.
    pub fn mss(&self) -> Option<u16> {
        let mut opts = &self.data[Self::MIN_HEADER_LEN..self.header_len];
        while let Some(&kind) = opts.first() {
            match kind {
                OPT_END => break,
                OPT_NOP => opts = &opts[1..],
                _ => {
                    let len = *opts.get(1)? as usize;
                    if len < 2 || len > opts.len() {
                        return None;
                    }
                    if kind == OPT_MSS && len == 4 {
                        return Some(u16::from_be_bytes([opts[2], opts[3]]));
                    }
                    opts = &opts[len..];
                }
            }
        }
        None
    }

    pub fn checksum_valid_ipv4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        checksum::transport_checksum_ipv4(src_ip, dst_ip, 6, self.data) == 0
    }
}

pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    /// When set, an MSS option is emitted (used on SYN segments).
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn header_len(&self) -> usize {
        TcpSegment::MIN_HEADER_LEN + if self.mss.is_some() { 4 } else { 0 }
    }

    pub fn build(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let header_len = self.header_len();
        let mut out = vec![0u8; header_len + self.payload.len()];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = (self.flags.0 & 0xff) as u8;
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        if let Some(mss) = self.mss {
            out[20] = OPT_MSS;
            out[21] = 4;
            out[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        out[header_len..].copy_from_slice(self.payload);

        // TCP has no "checksum disabled" value; a computed 0x0000 is written as-is.
        let csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, 6, &out);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_syn_with_mss() {
        let src_ip = Ipv4Addr::new(192, 0, 2, 1);
        let dst_ip = Ipv4Addr::new(192, 0, 2, 2);
        let buf = TcpSegmentBuilder {
            src_port: 1000,
            dst_port: 80,
            seq_number: 1,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 1024,
            mss: Some(1460),
            payload: &[],
        }
        .build(src_ip, dst_ip);
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.src_port(), 1000);
        assert_eq!(seg.dst_port(), 80);
        assert_eq!(seg.flags(), TcpFlags::SYN);
        assert_eq!(seg.mss(), Some(1460));
        assert!(seg.checksum_valid_ipv4(src_ip, dst_ip));
    }

    #[test]
    fn payload_follows_header() {
        let src_ip = Ipv4Addr::new(10, 0, 0, 1);
        let dst_ip = Ipv4Addr::new(10, 0, 0, 2);
        let buf = TcpSegmentBuilder {
            src_port: 1,
            dst_port: 2,
            seq_number: 9,
            ack_number: 4,
            flags: TcpFlags::ACK | TcpFlags::PSH,
            window_size: 512,
            mss: None,
            payload: b"data",
        }
        .build(src_ip, dst_ip);
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.payload(), b"data");
        assert_eq!(seg.mss(), None);
        assert!(seg.flags().contains(TcpFlags::ACK));
        assert!(seg.checksum_valid_ipv4(src_ip, dst_ip));
    }
}
