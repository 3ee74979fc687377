//! Internet checksum helpers for IPv4 headers and TCP segments.

use std::net::Ipv4Addr;

use super::PROTO_TCP;

/// Ones' complement sum of 16-bit big-endian words, folded and inverted.
/// A trailing odd byte is padded with zero.
pub fn ones_complement(mut sum: u32, bytes: &[u8]) -> u16 {
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add(u16::from_be_bytes([byte, 0]) as u32);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum over `bytes`.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    ones_complement(0, bytes)
}

/// IPv4 header checksum. The checksum field inside `header` must be zero.
pub fn ipv4_header(header: &[u8]) -> u16 {
    ones_complement(0, header)
}

/// TCP checksum over the IPv4 pseudo-header followed by `segment`.
pub fn tcp_ipv4(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = pseudo_header_sum(src, dst, segment.len());
    let mut chunks = segment.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    let tail = chunks.remainder();
    ones_complement(sum, tail)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, segment_len: usize) -> u32 {
    let src = src.octets();
    let dst = dst.octets();
    let words = [
        u16::from_be_bytes([src[0], src[1]]),
        u16::from_be_bytes([src[2], src[3]]),
        u16::from_be_bytes([dst[0], dst[1]]),
        u16::from_be_bytes([dst[2], dst[3]]),
        PROTO_TCP as u16,
        segment_len as u16,
    ];
    words.iter().map(|word| *word as u32).sum()
}
