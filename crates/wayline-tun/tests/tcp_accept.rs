//! Proves a SYN for an arbitrary destination actually reaches a listening
//! TCP socket: a hand-built IPv4 SYN goes in via `write`, and the
//! synthesized SYN-ACK smoltcp's own handshake state machine produces
//! comes back out via `read`, addressed back to the tunneled client.
//! Without a real listening socket bound to that destination, nothing
//! would ever come back here.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use wayline_packet::{NetAddr, PacketProxy, PacketRequestSender, PacketResponseReceiver};
use wayline_stream::{StreamConn, StreamDialer};
use wayline_tun::IpDevice;

const TCP_SYN: u8 = 0x02;
const TCP_ACK: u8 = 0x10;

struct UnusedDialer;

#[async_trait]
impl StreamDialer for UnusedDialer {
    async fn dial(&self, _address: &str) -> wayline_stream::Result<Arc<dyn StreamConn>> {
        panic!("handshake never completes in this test; dial must not be reached")
    }
}

struct UnusedProxy;

#[async_trait]
impl PacketProxy for UnusedProxy {
    async fn new_session(
        &self,
        _receiver: Arc<dyn PacketResponseReceiver>,
    ) -> wayline_packet::Result<Arc<dyn PacketRequestSender>> {
        panic!("this test carries no UDP traffic")
    }
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

fn build_ipv4_tcp_syn(src: SocketAddrV4, dst: SocketAddrV4, seq: u32) -> Vec<u8> {
    let tcp_len = 20;
    let total_len = 20 + tcp_len;
    let mut buf = vec![0u8; total_len];

    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[6] = 0x40;
    buf[8] = 64;
    buf[9] = 6; // TCP
    buf[12..16].copy_from_slice(&src.ip().octets());
    buf[16..20].copy_from_slice(&dst.ip().octets());
    let ip_checksum = ones_complement_checksum(&buf[0..20]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let tcp = &mut buf[20..];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 5 << 4; // data offset, no options
    tcp[13] = TCP_SYN;
    tcp[14..16].copy_from_slice(&64240u16.to_be_bytes()); // window

    let mut pseudo = Vec::with_capacity(12 + tcp_len);
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.push(0);
    pseudo.push(6);
    pseudo.extend_from_slice(&(tcp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&buf[20..20 + tcp_len]);
    let tcp_checksum = ones_complement_checksum(&pseudo);
    buf[20 + 16..20 + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    buf
}

fn parse_ipv4_tcp(packet: &[u8]) -> (SocketAddr, SocketAddr, u8) {
    assert_eq!(packet[0] >> 4, 4, "expected an IPv4 packet");
    let ihl = (packet[0] & 0x0F) as usize * 4;
    assert_eq!(packet[9], 6, "expected a TCP segment");
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let tcp = &packet[ihl..];
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    (
        SocketAddr::new(src_ip.into(), src_port),
        SocketAddr::new(dst_ip.into(), dst_port),
        tcp[13],
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn syn_to_arbitrary_destination_gets_a_syn_ack() {
    let device = IpDevice::new(Arc::new(UnusedDialer), Arc::new(UnusedProxy)).unwrap();

    let client = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51000);
    let server = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443);
    let syn = build_ipv4_tcp_syn(client, server, 1000);

    device.write(&syn).await.unwrap();

    let mut buf = vec![0u8; wayline_tun::MTU];
    let n = tokio::time::timeout(Duration::from_secs(2), device.read(&mut buf))
        .await
        .expect("device should produce a SYN-ACK before the timeout")
        .unwrap();

    let (reply_src, reply_dst, flags) = parse_ipv4_tcp(&buf[..n]);
    assert_eq!(reply_src, SocketAddr::V4(server), "reply must appear to come from the dialed destination");
    assert_eq!(reply_dst, SocketAddr::V4(client), "reply must be addressed back to the tunneled client");
    assert_eq!(
        flags & (TCP_SYN | TCP_ACK),
        TCP_SYN | TCP_ACK,
        "a listening socket must answer a new SYN with a SYN-ACK"
    );

    device.close().await.unwrap();
}
