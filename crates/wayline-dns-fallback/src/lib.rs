//! A [`PacketProxy`] that answers DNS-over-UDP queries locally with a
//! minimal truncated response (spec §4.6), for use when the remote proxy
//! this client otherwise relies on cannot carry UDP traffic at all. The
//! TC bit tells a conforming stub resolver to retry the same query over
//! TCP, which the remote proxy presumably *can* carry.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use wayline_errors::WaylineError;
use wayline_packet::{BufferPool, NetAddr, PacketProxy, PacketRequestSender, PacketResponseReceiver};

const DNS_PORT: u16 = 53;
const DNS_HEADER_LEN: usize = 12;
const MAX_DNS_UDP_LEN: usize = 512;
const BUFFER_POOL_SHARDS: usize = 16;

/// Synthesises a truncated DNS response for every query it sees, dropping
/// anything that isn't a DNS-over-UDP query to port 53.
pub struct DnsTruncationProxy {
    buffers: Arc<BufferPool>,
}

impl Default for DnsTruncationProxy {
    fn default() -> Self {
        Self {
            buffers: Arc::new(BufferPool::new(MAX_DNS_UDP_LEN, BUFFER_POOL_SHARDS)),
        }
    }
}

impl DnsTruncationProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PacketProxy for DnsTruncationProxy {
    async fn new_session(
        &self,
        receiver: Arc<dyn PacketResponseReceiver>,
    ) -> wayline_packet::Result<Arc<dyn PacketRequestSender>> {
        Ok(Arc::new(TruncationSession {
            receiver,
            closed: AtomicBool::new(false),
            buffers: self.buffers.clone(),
        }))
    }
}

struct TruncationSession {
    receiver: Arc<dyn PacketResponseReceiver>,
    closed: AtomicBool,
    buffers: Arc<BufferPool>,
}

#[async_trait]
impl PacketRequestSender for TruncationSession {
    async fn write_to(&self, payload: &[u8], destination: NetAddr) -> wayline_packet::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WaylineError::closed("DNS truncation session already closed"));
        }
        if destination.port() != DNS_PORT {
            return Err(WaylineError::port_unreachable(destination.port()));
        }
        if payload.len() < DNS_HEADER_LEN {
            return Err(WaylineError::invalid_message(payload.len()));
        }

        let key = destination.port() as u64;
        let mut buf = self.buffers.acquire(key);
        let len = payload.len().min(MAX_DNS_UDP_LEN);
        buf[..len].copy_from_slice(&payload[..len]);

        // QR (response) and TC (truncated) bits, byte 2.
        buf[2] |= 0x82;
        // Clear RCODE, low nibble of byte 3.
        buf[3] &= 0xF0;
        // ANCOUNT (bytes 6-7) := QDCOUNT (bytes 4-5). Required so
        // resolvers that only retry over TCP when ANCOUNT is non-zero
        // actually do so; the upstream query's own QDCOUNT is never
        // zero for a well-formed question.
        buf[6] = buf[4];
        buf[7] = buf[5];

        debug!(target: "wayline::dns_fallback", %destination, len, "synthesized truncated DNS response");
        self.receiver.write_from(&buf[..len], destination).await
    }

    async fn close(&self) -> wayline_packet::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(WaylineError::closed("DNS truncation session already closed"));
        }
        self.receiver.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    fn addr(ip: [u8; 4], port: u16) -> NetAddr {
        NetAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    /// A minimal DNS query: 12-byte header (ID 0x2468, QR=0/TC=0,
    /// QDCOUNT=2, ANCOUNT=0) followed by two questions and one OPT
    /// additional record. The question bytes are arbitrary filler; only
    /// the header fields and overall shape matter to these tests.
    fn sample_query() -> Vec<u8> {
        let mut buf = vec![0u8; DNS_HEADER_LEN];
        buf[0] = 0x24;
        buf[1] = 0x68;
        buf[2] = 0x01; // RD bit set, QR=0
        buf[3] = 0x00;
        buf[4] = 0x00;
        buf[5] = 0x02; // QDCOUNT = 2
        buf[6] = 0x00;
        buf[7] = 0x00; // ANCOUNT = 0
        buf[8] = 0x00;
        buf[9] = 0x00;
        buf[10] = 0x00;
        buf[11] = 0x01; // ARCOUNT = 1 (the OPT record)
        buf.extend_from_slice(b"\x03www\x06google\x03com\x00\x00\x01\x00\x01");
        buf.extend_from_slice(b"\x03www\x07youtube\x03com\x00\x00\x01\x00\x01");
        buf.extend_from_slice(b"\x00\x00\x29\x10\x00\x00\x00\x00\x00\x00\x00"); // OPT
        buf
    }

    struct RecordingReceiver {
        calls: Mutex<Vec<(Vec<u8>, NetAddr)>>,
        closed: AtomicBool,
    }

    impl RecordingReceiver {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PacketResponseReceiver for RecordingReceiver {
        async fn write_from(&self, payload: &[u8], source: NetAddr) -> wayline_packet::Result<()> {
            self.calls.lock().unwrap().push((payload.to_vec(), source));
            Ok(())
        }
        async fn close(&self) -> wayline_packet::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn truncation_bits_are_set_and_question_section_preserved() {
        let proxy = DnsTruncationProxy::new();
        let receiver = Arc::new(RecordingReceiver::new());
        let sender = proxy.new_session(receiver.clone()).await.unwrap();

        let query = sample_query();
        let dest = addr([1, 2, 3, 4], 53);
        sender.write_to(&query, dest).await.unwrap();

        let calls = receiver.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (response, got_dest) = &calls[0];
        assert_eq!(*got_dest, dest);
        assert_eq!(response.len(), query.len());
        assert_eq!(response[2] & 0x82, 0x82, "QR and TC bits must both be set");
        assert_eq!(response[3] & 0x0F, 0, "RCODE nibble must be cleared");
        assert_eq!(&response[4..6], &query[4..6], "QDCOUNT preserved");
        assert_eq!(&response[6..8], &query[4..6], "ANCOUNT copied from QDCOUNT");
        assert_eq!(&response[12..], &query[12..], "question section byte-identical");
    }

    #[tokio::test]
    async fn non_dns_port_is_rejected_without_touching_receiver() {
        let proxy = DnsTruncationProxy::new();
        let receiver = Arc::new(RecordingReceiver::new());
        let sender = proxy.new_session(receiver.clone()).await.unwrap();

        let query = sample_query();
        let err = sender
            .write_to(&query, addr([3, 4, 5, 6], 54))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), wayline_errors::ErrorKind::PortUnreachable);
        assert!(receiver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_query_is_rejected() {
        let proxy = DnsTruncationProxy::new();
        let receiver = Arc::new(RecordingReceiver::new());
        let sender = proxy.new_session(receiver.clone()).await.unwrap();

        let short = vec![0u8; 11];
        let err = sender.write_to(&short, addr([1, 2, 3, 4], 53)).await.unwrap_err();
        assert!(err.to_string().contains("length 11"));
        assert!(receiver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn encoding_the_same_query_twice_is_deterministic() {
        let proxy = DnsTruncationProxy::new();
        let receiver = Arc::new(RecordingReceiver::new());
        let sender = proxy.new_session(receiver.clone()).await.unwrap();

        let query = sample_query();
        let dest = addr([1, 2, 3, 4], 53);
        sender.write_to(&query, dest).await.unwrap();
        sender.write_to(&query, dest).await.unwrap();

        let calls = receiver.calls.lock().unwrap();
        assert_eq!(calls[0].0, calls[1].0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let proxy = DnsTruncationProxy::new();
        let receiver = Arc::new(RecordingReceiver::new());
        let sender = proxy.new_session(receiver.clone()).await.unwrap();

        sender.close().await.unwrap();
        assert!(receiver.closed.load(Ordering::SeqCst));

        let err = sender.close().await.unwrap_err();
        assert_eq!(err.kind(), wayline_errors::ErrorKind::Closed);
    }
}
