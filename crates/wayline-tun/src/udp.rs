use crate::packet;
use crate::worker::Shared;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wayline_errors::WaylineError;
use wayline_packet::{NetAddr, PacketResponseReceiver};

/// Bridges one UDP "flow" accepted from the tunnel back out to the
/// tunneled application (spec §4.5 UDP acceptance/downstream).
///
/// `close` is the single authoritative teardown path: it may run from
/// either the sender side (on a fatal write error) or the stack side (on
/// idle timeout), so it must be idempotent and must not deadlock against
/// the session-table lock it removes itself from.
pub struct StackUdpReceiver {
    shared: Arc<Shared>,
    /// The tunneled application's own address — always the destination
    /// of replies, regardless of which upstream server answered.
    client: SocketAddr,
    closed: AtomicBool,
}

impl StackUdpReceiver {
    pub(crate) fn new(shared: Arc<Shared>, client: SocketAddr) -> Self {
        Self {
            shared,
            client,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PacketResponseReceiver for StackUdpReceiver {
    async fn write_from(&self, payload: &[u8], source: NetAddr) -> wayline_packet::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WaylineError::closed("UDP session already closed"));
        }
        // Spoof the reply's source as `source` (the server the tunneled
        // app believes it queried) so the transparent NAT illusion holds.
        let spoofed_source = SocketAddr::from(source);
        let datagram = packet::build_udp(spoofed_source, self.client, payload).ok_or_else(|| {
            WaylineError::unsupported("cannot bridge UDP reply across address families")
        })?;
        self.shared.enqueue_outbound(datagram).await
    }

    async fn close(&self) -> wayline_packet::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(WaylineError::closed("UDP session already closed"));
        }
        self.shared.udp_sessions.remove(&self.client);
        Ok(())
    }
}
