use std::net::Ipv4Addr;

/// Ones'-complement sum of `data` folded into `acc` (not yet complemented).
fn sum_words(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([c[0], c[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        acc = acc.wrapping_add((*last as u32) << 8);
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    fold(sum_words(0, header))
}

/// TCP/UDP checksum over the IPv4 pseudo header and `segment`. Returns 0 for a segment whose
/// embedded checksum is valid.
pub fn transport_checksum_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut acc = sum_words(0, &src.octets());
    acc = sum_words(acc, &dst.octets());
    acc = acc.wrapping_add(protocol as u32);
    acc = acc.wrapping_add(segment.len() as u32);
    fold(sum_words(acc, segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ipv4_header() {
        // The classic worked example: 192.168.0.1 -> 192.168.0.199, UDP.
        let mut hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let csum = ipv4_header_checksum(&hdr);
        assert_eq!(csum, 0xb861);
        hdr[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(ipv4_header_checksum(&hdr), 0);
    }
}
