use super::checksum::{ipv4_header, tcp_ipv4};
use super::*;
use smoltcp::wire::{IpAddress, Ipv4Address, Ipv4Packet, TcpPacket};

const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Builds a TCP datagram through the codec's own encoders.
fn make_tcp_datagram(tcp: TcpHeader, payload: &[u8]) -> Vec<u8> {
    let tcp_len = tcp.encoded_len();
    let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN + tcp_len + payload.len()];
    Ipv4Header::new(DEVICE_IP, REMOTE_IP, PROTO_TCP, tcp_len + payload.len())
        .encode(&mut packet);
    tcp.encode(&mut packet[IPV4_MIN_HEADER_LEN..]);
    packet[IPV4_MIN_HEADER_LEN + tcp_len..].copy_from_slice(payload);
    let checksum = tcp_ipv4(DEVICE_IP, REMOTE_IP, &packet[IPV4_MIN_HEADER_LEN..]);
    packet[IPV4_MIN_HEADER_LEN + 16..IPV4_MIN_HEADER_LEN + 18]
        .copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn syn_header() -> TcpHeader {
    TcpHeader {
        src_port: 40000,
        dst_port: 443,
        seq: 0xFFFF_FF00,
        ack: 0,
        flags: TcpFlags::SYN,
        window: 64240,
        header_len: 24,
        mss: Some(1460),
    }
}

#[test]
fn checksum_matches_rfc1071_example() {
    let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
    assert_eq!(internet_checksum(&bytes), 0x220d);
}

#[test]
fn checksum_pads_odd_length() {
    // A trailing byte counts as the high half of a zero-padded word.
    assert_eq!(internet_checksum(&[0x12]), !0x1200u16);
    assert_eq!(internet_checksum(&[]), 0xFFFF);
}

#[test]
fn ipv4_header_checksum_matches_known_header() {
    let mut header = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];
    assert_eq!(ipv4_header(&header), 0xb861);

    header[10] = 0xb8;
    header[11] = 0x61;
    // A header carrying its own checksum sums to zero.
    assert_eq!(ipv4_header(&header), 0);
}

#[test]
fn ipv4_header_round_trips() {
    let mut bytes = [0u8; IPV4_MIN_HEADER_LEN];
    let original = Ipv4Header::new(DEVICE_IP, REMOTE_IP, PROTO_TCP, 32);
    let checksum = original.encode(&mut bytes);

    let decoded = decode_ipv4(&bytes).expect("decode encoded header");
    assert_eq!(decoded.checksum, checksum);
    assert_eq!(decoded, Ipv4Header { checksum, ..original });

    let oracle = Ipv4Packet::new_checked(&bytes[..]).expect("oracle parse");
    assert!(oracle.verify_checksum(), "header checksum rejected");
    assert!(oracle.dont_frag());
    assert_eq!(oracle.hop_limit(), 64);
}

#[test]
fn decode_ipv4_rejects_short_buffer() {
    assert_eq!(decode_ipv4(&[0x45; 19]), Err(ParseError::Truncated(19)));
}

#[test]
fn decode_ipv4_rejects_bad_ihl() {
    let mut bytes = [0u8; IPV4_MIN_HEADER_LEN];
    Ipv4Header::new(DEVICE_IP, REMOTE_IP, PROTO_TCP, 0).encode(&mut bytes);

    bytes[0] = 0x44;
    assert!(matches!(
        decode_ipv4(&bytes),
        Err(ParseError::BadHeaderLength { header_len: 16, .. })
    ));

    bytes[0] = 0x46;
    assert!(matches!(
        decode_ipv4(&bytes),
        Err(ParseError::BadHeaderLength { header_len: 24, available: 20 })
    ));
}

#[test]
fn decode_ipv4_rejects_ipv6() {
    let mut bytes = [0u8; 40];
    bytes[0] = 0x65;
    assert_eq!(
        decode_ipv4(&bytes),
        Err(ParseError::UnsupportedIpVersion(6))
    );
}

#[test]
fn decode_tcp_reads_header_and_mss() {
    let packet = make_tcp_datagram(syn_header(), &[]);
    let tcp = decode_tcp(&packet, IPV4_MIN_HEADER_LEN).expect("decode tcp");

    assert_eq!(tcp.src_port, 40000);
    assert_eq!(tcp.dst_port, 443);
    assert_eq!(tcp.seq, 0xFFFF_FF00);
    assert!(tcp.is_syn());
    assert!(!tcp.is_ack());
    assert_eq!(tcp.header_len, 24);
    assert_eq!(tcp.mss, Some(1460));
}

#[test]
fn decode_tcp_skips_unknown_options() {
    let mut packet = make_tcp_datagram(
        TcpHeader {
            mss: None,
            ..syn_header()
        },
        &[],
    );
    // Rewrite as a 32-byte header: NOP, NOP, SACK-permitted, MSS 1200, EOL.
    let options = [1, 1, 4, 2, 2, 4, 0x04, 0xb0, 0, 0, 0, 0];
    packet.extend_from_slice(&options);
    packet[IPV4_MIN_HEADER_LEN + 12] = 8 << 4;

    let tcp = decode_tcp(&packet, IPV4_MIN_HEADER_LEN).expect("decode tcp");
    assert_eq!(tcp.header_len, 32);
    assert_eq!(tcp.mss, Some(1200));
}

#[test]
fn decode_tcp_rejects_bad_data_offset() {
    let mut packet = make_tcp_datagram(
        TcpHeader {
            mss: None,
            ..syn_header()
        },
        &[],
    );
    packet[IPV4_MIN_HEADER_LEN + 12] = 4 << 4;
    assert_eq!(
        decode_tcp(&packet, IPV4_MIN_HEADER_LEN),
        Err(ParseError::MalformedTcpSegment)
    );

    packet[IPV4_MIN_HEADER_LEN + 12] = 15 << 4;
    assert_eq!(
        decode_tcp(&packet, IPV4_MIN_HEADER_LEN),
        Err(ParseError::MalformedTcpSegment)
    );
}

#[test]
fn decode_tcp_rejects_truncated_segment() {
    let packet = make_tcp_datagram(syn_header(), &[]);
    let err = decode_tcp(&packet[..IPV4_MIN_HEADER_LEN + 12], IPV4_MIN_HEADER_LEN)
        .expect_err("short segment accepted");
    assert!(err.is_tcp_error());
}

#[test]
fn encoded_segment_passes_independent_checksum() {
    let header = TcpHeader {
        flags: TcpFlags::ACK | TcpFlags::PSH,
        ack: 7,
        mss: None,
        header_len: TCP_MIN_HEADER_LEN,
        ..syn_header()
    };
    let packet = make_tcp_datagram(header, b"odd-length payload!");

    let ip = Ipv4Packet::new_checked(&packet[..]).expect("oracle ip parse");
    assert!(ip.verify_checksum());
    let tcp = TcpPacket::new_checked(ip.payload()).expect("oracle tcp parse");
    let src = IpAddress::Ipv4(Ipv4Address::from(DEVICE_IP));
    let dst = IpAddress::Ipv4(Ipv4Address::from(REMOTE_IP));
    assert!(tcp.verify_checksum(&src, &dst), "tcp checksum rejected");
    assert!(tcp.psh());
    assert_eq!(tcp.payload(), b"odd-length payload!");
}

#[test]
fn parse_packet_extracts_payload() {
    let header = TcpHeader {
        flags: TcpFlags::ACK,
        mss: None,
        header_len: TCP_MIN_HEADER_LEN,
        ..syn_header()
    };
    let packet = make_tcp_datagram(header, b"GET / HTTP/1.1\r\n");

    match parse_packet(&packet).expect("parse") {
        ParsedPacket::Tcp(segment) => {
            assert_eq!(segment.ip.src, DEVICE_IP);
            assert_eq!(segment.ip.dst, REMOTE_IP);
            assert_eq!(segment.payload, b"GET / HTTP/1.1\r\n");
        }
        other => panic!("expected tcp, got {other:?}"),
    }
}

#[test]
fn parse_packet_ignores_link_padding() {
    let header = TcpHeader {
        flags: TcpFlags::ACK,
        mss: None,
        header_len: TCP_MIN_HEADER_LEN,
        ..syn_header()
    };
    let mut packet = make_tcp_datagram(header, b"abc");
    packet.extend_from_slice(&[0u8; 6]);

    let ParsedPacket::Tcp(segment) = parse_packet(&packet).expect("parse") else {
        panic!("expected tcp");
    };
    assert_eq!(segment.payload, b"abc");
}

#[test]
fn parse_packet_tags_other_protocols() {
    let mut bytes = vec![0u8; 28];
    Ipv4Header::new(DEVICE_IP, REMOTE_IP, PROTO_UDP, 8).encode(&mut bytes);
    assert!(matches!(
        parse_packet(&bytes),
        Ok(ParsedPacket::Other {
            protocol: PROTO_UDP
        })
    ));
}

/// Rewrites the IPv4 total length and refreshes the header checksum.
fn set_total_len(packet: &mut [u8], total_len: u16) {
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[10..12].fill(0);
    let checksum = ipv4_header(&packet[..IPV4_MIN_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

#[test]
fn decode_ipv4_rejects_total_length_below_header() {
    let mut bytes = [0u8; IPV4_MIN_HEADER_LEN];
    Ipv4Header::new(DEVICE_IP, REMOTE_IP, PROTO_TCP, 0).encode(&mut bytes);
    set_total_len(&mut bytes, 12);
    assert_eq!(
        decode_ipv4(&bytes),
        Err(ParseError::BadHeaderLength {
            header_len: 20,
            available: 12
        })
    );
}

#[test]
fn parse_packet_rejects_tcp_header_past_total_length() {
    let mut packet = make_tcp_datagram(syn_header(), &[]);

    set_total_len(&mut packet, IPV4_MIN_HEADER_LEN as u16);
    assert!(matches!(
        parse_packet(&packet),
        Err(ParseError::MalformedTcpSegment)
    ));

    // Room for the fixed header but not the MSS option it announces.
    set_total_len(&mut packet, (IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN) as u16);
    assert!(matches!(
        parse_packet(&packet),
        Err(ParseError::MalformedTcpSegment)
    ));
}
