//! IPv4 and TCP header codec.
//!
//! Decoding never validates checksums: datagrams arrive from the local
//! virtual interface, which is trusted. Encoding always recomputes them.

pub mod checksum;

use bitflags::bitflags;
use std::net::Ipv4Addr;
use thiserror::Error;

pub use checksum::internet_checksum;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const TCP_MSS_OPTION_LEN: usize = 4;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

/// Detailed reason a datagram was rejected by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram shorter than an IPv4 header ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("IPv4 header length {header_len} outside [20, {available}]")]
    BadHeaderLength { header_len: usize, available: usize },
    #[error("malformed TCP segment")]
    MalformedTcpSegment,
}

impl ParseError {
    pub fn is_tcp_error(&self) -> bool {
        matches!(self, Self::MalformedTcpSegment)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub header_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for a locally built datagram: no options, DF set, TTL 64.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> Self {
        Self {
            version: 4,
            header_len: IPV4_MIN_HEADER_LEN,
            tos: 0,
            total_len: (IPV4_MIN_HEADER_LEN + payload_len) as u16,
            identification: 0,
            flags_fragment: 0x4000,
            ttl: 64,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Writes a 20-byte header into `out` and recomputes the checksum.
    /// IP options are never re-emitted. Returns the checksum written.
    pub fn encode(&self, out: &mut [u8]) -> u16 {
        let out = &mut out[..IPV4_MIN_HEADER_LEN];
        out[0] = (4 << 4) | (IPV4_MIN_HEADER_LEN / 4) as u8;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let checksum = checksum::ipv4_header(out);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());
        checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub header_len: usize,
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    /// Length of the header `encode` produces.
    pub fn encoded_len(&self) -> usize {
        if self.mss.is_some() {
            TCP_MIN_HEADER_LEN + TCP_MSS_OPTION_LEN
        } else {
            TCP_MIN_HEADER_LEN
        }
    }

    /// Writes the header (plus the MSS option when set) into `out` with a
    /// zero checksum. The caller fills the checksum once the payload is in
    /// place, see [`checksum::tcp_ipv4`].
    pub fn encode(&self, out: &mut [u8]) -> usize {
        let len = self.encoded_len();
        let out = &mut out[..len];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((len / 4) as u8) << 4;
        out[13] = self.flags.bits();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&0u16.to_be_bytes());
        if let Some(mss) = self.mss {
            out[20] = TCP_OPT_MSS;
            out[21] = TCP_MSS_OPTION_LEN as u8;
            out[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        len
    }
}

/// A decoded TCP datagram borrowing its payload from the read buffer.
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub enum ParsedPacket<'a> {
    Tcp(TcpSegment<'a>),
    Other { protocol: u8 },
}

pub fn decode_ipv4(bytes: &[u8]) -> Result<Ipv4Header, ParseError> {
    if bytes.len() < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::Truncated(bytes.len()));
    }
    let version = bytes[0] >> 4;
    let header_len = ((bytes[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > bytes.len() {
        return Err(ParseError::BadHeaderLength {
            header_len,
            available: bytes.len(),
        });
    }
    if version != 4 {
        return Err(ParseError::UnsupportedIpVersion(version));
    }
    let total_len = u16::from_be_bytes([bytes[2], bytes[3]]);
    if (total_len as usize) < header_len {
        return Err(ParseError::BadHeaderLength {
            header_len,
            available: total_len as usize,
        });
    }
    Ok(Ipv4Header {
        version,
        header_len,
        tos: bytes[1],
        total_len,
        identification: u16::from_be_bytes([bytes[4], bytes[5]]),
        flags_fragment: u16::from_be_bytes([bytes[6], bytes[7]]),
        ttl: bytes[8],
        protocol: bytes[9],
        checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
        src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
        dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
    })
}

pub fn decode_tcp(bytes: &[u8], ip_header_len: usize) -> Result<TcpHeader, ParseError> {
    let Some(segment) = bytes.get(ip_header_len..) else {
        return Err(ParseError::MalformedTcpSegment);
    };
    if segment.len() < TCP_MIN_HEADER_LEN {
        return Err(ParseError::MalformedTcpSegment);
    }
    let header_len = ((segment[12] >> 4) as usize) * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > segment.len() {
        return Err(ParseError::MalformedTcpSegment);
    }
    Ok(TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags::from_bits_truncate(segment[13]),
        window: u16::from_be_bytes([segment[14], segment[15]]),
        header_len,
        mss: parse_mss(&segment[TCP_MIN_HEADER_LEN..header_len]),
    })
}

fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == TCP_OPT_MSS && len == TCP_MSS_OPTION_LEN {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

/// Decodes a whole datagram and tags it by transport protocol.
pub fn parse_packet(bytes: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    let ip = decode_ipv4(bytes)?;
    if ip.protocol != PROTO_TCP {
        return Ok(ParsedPacket::Other {
            protocol: ip.protocol,
        });
    }
    // Link-layer padding past total_len is not part of the datagram, and the
    // TCP header has to fit inside what total_len claims.
    let datagram = &bytes[..(ip.total_len as usize).min(bytes.len())];
    let tcp = decode_tcp(datagram, ip.header_len)?;
    let start = ip.header_len + tcp.header_len;
    Ok(ParsedPacket::Tcp(TcpSegment {
        ip,
        tcp,
        payload: &datagram[start..],
    }))
}

#[cfg(test)]
mod tests;
