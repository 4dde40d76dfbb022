//! Minimal raw IPv4/IPv6 + UDP header parsing and synthesis, plus just
//! enough TCP header parsing to recognize a new-connection SYN.
//!
//! UDP flows are handled without involving smoltcp's socket layer at all:
//! a wildcard bind big enough to catch every destination port a tunneled
//! app might use isn't practical through smoltcp's `udp::Socket`, and
//! datagrams need no reassembly, so it's simpler (and lets replies spoof
//! the original destination as their source, the "transparent NAT" trick
//! these devices rely on) to parse and build them by hand and never hand
//! UDP packets to the stack at all.
//!
//! TCP is the mirror image: smoltcp's own reassembly and handshake state
//! machine is used (unlike UDP, it needs real sequencing and
//! retransmission), but smoltcp has no "accept any destination" listen
//! mode, so [`parse_tcp_syn`] is used only to notice the (client, server)
//! pair a brand new connection targets, early enough to create a socket
//! listening on that exact destination before the SYN is handed to the
//! stack for the handshake itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const IPV4_PROTO_UDP: u8 = 17;
const IPV6_NEXT_HEADER_UDP: u8 = 17;
const IPV4_PROTO_TCP: u8 = 6;
const IPV6_NEXT_HEADER_TCP: u8 = 6;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_ACK: u8 = 0x10;

pub struct ParsedUdp {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload_start: usize,
    pub payload_end: usize,
}

/// Returns `Some` if `packet` is a well-formed IPv4 or IPv6 datagram
/// carrying UDP with no extension headers; `None` for anything else
/// (malformed packets, or protocols this device doesn't special-case,
/// which are instead handed to the smoltcp stack for TCP reassembly).
pub fn parse_udp(packet: &[u8]) -> Option<ParsedUdp> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => parse_udp_v4(packet),
        6 => parse_udp_v6(packet),
        _ => None,
    }
}

fn parse_udp_v4(packet: &[u8]) -> Option<ParsedUdp> {
    if packet.len() < 20 {
        return None;
    }
    let ihl = (packet[0] & 0x0F) as usize * 4;
    if ihl < 20 || packet.len() < ihl + 8 {
        return None;
    }
    if packet[9] != IPV4_PROTO_UDP {
        return None;
    }
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let udp = &packet[ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < 8 || ihl + udp_len > packet.len() {
        return None;
    }
    Some(ParsedUdp {
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        payload_start: ihl + 8,
        payload_end: ihl + udp_len,
    })
}

fn parse_udp_v6(packet: &[u8]) -> Option<ParsedUdp> {
    const HEADER_LEN: usize = 40;
    if packet.len() < HEADER_LEN + 8 {
        return None;
    }
    if packet[6] != IPV6_NEXT_HEADER_UDP {
        return None;
    }
    let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
    let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);
    let udp = &packet[HEADER_LEN..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < 8 || HEADER_LEN + udp_len > packet.len() {
        return None;
    }
    Some(ParsedUdp {
        src: SocketAddr::new(IpAddr::V6(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V6(dst_ip), dst_port),
        payload_start: HEADER_LEN + 8,
        payload_end: HEADER_LEN + udp_len,
    })
}

pub struct ParsedTcpSyn {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Returns `Some` if `packet` is a well-formed IPv4 or IPv6 segment
/// opening a new TCP connection (SYN set, ACK clear) with no extension
/// headers; `None` for SYN-ACKs, non-SYN segments, and non-TCP
/// protocols, which are left to whatever TCP socket the stack already
/// has listening or established for them.
pub fn parse_tcp_syn(packet: &[u8]) -> Option<ParsedTcpSyn> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => parse_tcp_syn_v4(packet),
        6 => parse_tcp_syn_v6(packet),
        _ => None,
    }
}

fn is_new_connection_syn(flags: u8) -> bool {
    flags & (TCP_FLAG_SYN | TCP_FLAG_ACK) == TCP_FLAG_SYN
}

fn parse_tcp_syn_v4(packet: &[u8]) -> Option<ParsedTcpSyn> {
    if packet.len() < 20 {
        return None;
    }
    let ihl = (packet[0] & 0x0F) as usize * 4;
    if ihl < 20 || packet.len() < ihl + 20 {
        return None;
    }
    if packet[9] != IPV4_PROTO_TCP {
        return None;
    }
    let tcp = &packet[ihl..];
    if !is_new_connection_syn(tcp[13]) {
        return None;
    }
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    if src_port == 0 || dst_port == 0 {
        return None;
    }
    Some(ParsedTcpSyn {
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
    })
}

fn parse_tcp_syn_v6(packet: &[u8]) -> Option<ParsedTcpSyn> {
    const HEADER_LEN: usize = 40;
    if packet.len() < HEADER_LEN + 20 {
        return None;
    }
    if packet[6] != IPV6_NEXT_HEADER_TCP {
        return None;
    }
    let tcp = &packet[HEADER_LEN..];
    if !is_new_connection_syn(tcp[13]) {
        return None;
    }
    let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
    let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    if src_port == 0 || dst_port == 0 {
        return None;
    }
    Some(ParsedTcpSyn {
        src: SocketAddr::new(IpAddr::V6(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V6(dst_ip), dst_port),
    })
}

/// Builds a UDP datagram appearing to come from `src` addressed to
/// `dst`, the minimal packet-forging a transparent proxy needs to make
/// a relayed reply look like it came directly from the queried server.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    match (src, dst) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => Some(build_udp_v4(src, dst, payload)),
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => Some(build_udp_v6(src, dst, payload)),
        _ => None,
    }
}

fn build_udp_v4(src: std::net::SocketAddrV4, dst: std::net::SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut buf = vec![0u8; total_len];

    buf[0] = 0x45; // version 4, IHL 5 words
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[6] = 0x40; // don't-fragment
    buf[8] = 64; // TTL
    buf[9] = IPV4_PROTO_UDP;
    buf[12..16].copy_from_slice(&src.ip().octets());
    buf[16..20].copy_from_slice(&dst.ip().octets());
    let ip_checksum = ones_complement_checksum(&buf[0..20]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let udp = &mut buf[20..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.push(0);
    pseudo.push(IPV4_PROTO_UDP);
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&buf[20..20 + udp_len]);
    let udp_checksum = ones_complement_checksum(&pseudo);
    buf[20 + 6..20 + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buf
}

fn build_udp_v6(src: std::net::SocketAddrV6, dst: std::net::SocketAddrV6, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 40 + udp_len;
    let mut buf = vec![0u8; total_len];

    buf[0] = 0x60; // version 6
    buf[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buf[6] = IPV6_NEXT_HEADER_UDP;
    buf[7] = 64; // hop limit
    buf[8..24].copy_from_slice(&src.ip().octets());
    buf[24..40].copy_from_slice(&dst.ip().octets());

    let udp = &mut buf[40..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let mut pseudo = Vec::with_capacity(40 + udp_len);
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, IPV6_NEXT_HEADER_UDP]);
    pseudo.extend_from_slice(&buf[40..40 + udp_len]);
    let udp_checksum = ones_complement_checksum(&pseudo);
    buf[40 + 6..40 + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buf
}

fn ones_complement_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
