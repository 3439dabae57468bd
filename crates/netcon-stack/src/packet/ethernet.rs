use super::{ensure_len, MacAddr, PacketError};

pub struct EtherType;

impl EtherType {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const IPV6: u16 = 0x86dd;
}

pub const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = ETHERNET_HEADER_LEN;

    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, Self::HEADER_LEN)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
            payload: &buf[Self::HEADER_LEN..],
        })
    }

    pub fn header(dst: MacAddr, src: MacAddr, ethertype: u16) -> [u8; ETHERNET_HEADER_LEN] {
        let mut out = [0u8; ETHERNET_HEADER_LEN];
        out[0..6].copy_from_slice(&dst.0);
        out[6..12].copy_from_slice(&src.0);
        out[12..14].copy_from_slice(&ethertype.to_be_bytes());
        out
    }

    pub fn serialize(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + payload.len());
        out.extend_from_slice(&Self::header(dst, src, ethertype));
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_frame() {
        assert!(EthernetFrame::parse(&[0u8; 13]).is_err());
        let frame = EthernetFrame::serialize(MacAddr::BROADCAST, MacAddr([2; 6]), EtherType::ARP, b"x");
        let parsed = EthernetFrame::parse(&frame).unwrap();
        assert_eq!(parsed.dst, MacAddr::BROADCAST);
        assert_eq!(parsed.ethertype, EtherType::ARP);
        assert_eq!(parsed.payload, b"x");
    }

    #[test]
    fn header_is_the_serialized_prefix() {
        let src = MacAddr([2, 0, 0, 0, 0, 1]);
        let header = EthernetFrame::header(MacAddr::BROADCAST, src, EtherType::IPV4);
        assert_eq!(header.len(), EthernetFrame::HEADER_LEN);
        let frame = EthernetFrame::serialize(MacAddr::BROADCAST, src, EtherType::IPV4, b"abc");
        assert_eq!(&frame[..ETHERNET_HEADER_LEN], &header[..]);
        assert_eq!(&header[12..], &[0x08, 0x00]);
    }
}
