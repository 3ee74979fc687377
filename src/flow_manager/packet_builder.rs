//! Reply datagrams toward the device.
//!
//! Every reply appears to come from the remote endpoint: addresses and ports
//! are swapped relative to the [`FlowKey`], and both checksums are computed.

use super::state::FlowKey;
use crate::codec::{
    checksum, Ipv4Header, TcpFlags, TcpHeader, TcpSegment, IPV4_MIN_HEADER_LEN, PROTO_TCP,
};

/// Receive window advertised to the device. The engine relays as fast as
/// the proxy accepts writes, so it never shrinks.
pub(crate) const REPLY_WINDOW: u16 = 65535;

pub(crate) fn build_segment(
    key: &FlowKey,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = TcpHeader {
        src_port: key.dst_port,
        dst_port: key.src_port,
        seq,
        ack,
        flags,
        window: REPLY_WINDOW,
        header_len: 0,
        mss,
    };
    tcp.header_len = tcp.encoded_len();
    let segment_len = tcp.header_len + payload.len();
    let mut buffer = vec![0u8; IPV4_MIN_HEADER_LEN + segment_len];

    Ipv4Header::new(key.dst_ip, key.src_ip, PROTO_TCP, segment_len).encode(&mut buffer);
    let offset = IPV4_MIN_HEADER_LEN;
    tcp.encode(&mut buffer[offset..]);
    buffer[offset + tcp.header_len..].copy_from_slice(payload);

    let tcp_checksum = checksum::tcp_ipv4(key.dst_ip, key.src_ip, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    buffer
}

pub(crate) fn syn_ack(key: &FlowKey, iss: u32, ack: u32, mss: u16) -> Vec<u8> {
    build_segment(key, TcpFlags::SYN | TcpFlags::ACK, iss, ack, Some(mss), &[])
}

pub(crate) fn ack(key: &FlowKey, seq: u32, ack: u32) -> Vec<u8> {
    build_segment(key, TcpFlags::ACK, seq, ack, None, &[])
}

pub(crate) fn data(key: &FlowKey, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    build_segment(key, TcpFlags::ACK | TcpFlags::PSH, seq, ack, None, payload)
}

pub(crate) fn fin_ack(key: &FlowKey, seq: u32, ack: u32) -> Vec<u8> {
    build_segment(key, TcpFlags::FIN | TcpFlags::ACK, seq, ack, None, &[])
}

pub(crate) fn rst_ack(key: &FlowKey, seq: u32, ack: u32) -> Vec<u8> {
    build_segment(key, TcpFlags::RST | TcpFlags::ACK, seq, ack, None, &[])
}

/// Bare ACK for a segment that has no flow, covering its payload and FIN.
pub(crate) fn ack_unsolicited(segment: &TcpSegment<'_>) -> Vec<u8> {
    let key = FlowKey::from_segment(segment);
    let seq = if segment.tcp.is_ack() {
        segment.tcp.ack
    } else {
        0
    };
    let consumed = segment.payload.len() as u32 + u32::from(segment.tcp.is_fin());
    ack(&key, seq, segment.tcp.seq.wrapping_add(consumed))
}
