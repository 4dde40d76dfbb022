use crate::Result;
use async_trait::async_trait;
use std::io;
use tokio::net::UdpSocket;
use wayline_errors::WaylineError;
use wayline_packet::NetAddr;

/// One bidirectional UDP socket, the capability a [`PacketListener`]
/// hands out per flow.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, NetAddr)>;
    async fn send_to(&self, buf: &[u8], destination: NetAddr) -> Result<usize>;
    fn local_addr(&self) -> Option<NetAddr>;
    async fn close(&self) -> Result<()>;
}

/// A factory for [`DatagramSocket`]s, one per UDP "flow" (spec §4.4).
#[async_trait]
pub trait PacketListener: Send + Sync + 'static {
    async fn listen_packet(&self) -> Result<std::sync::Arc<dyn DatagramSocket>>;
}

/// A [`PacketListener`] that opens a fresh wildcard-bound UDP socket per
/// call — the default when the upstream proxy client has no special
/// socket requirements.
#[derive(Clone, Default)]
pub struct UdpPacketListener {
    bind_addr: std::net::SocketAddr,
}

impl UdpPacketListener {
    pub fn new(bind_addr: std::net::SocketAddr) -> Self {
        Self { bind_addr }
    }
}

#[async_trait]
impl PacketListener for UdpPacketListener {
    async fn listen_packet(&self) -> Result<std::sync::Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(WaylineError::from)?;
        Ok(std::sync::Arc::new(TokioDatagramSocket { socket }))
    }
}

struct TokioDatagramSocket {
    socket: UdpSocket,
}

#[async_trait]
impl DatagramSocket for TokioDatagramSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, NetAddr)> {
        loop {
            match self.socket.recv_from(buf).await {
                Ok((n, addr)) => return Ok((n, NetAddr::from(addr))),
                // A too-small buffer for one datagram is transient — the
                // spec calls for the read loop to continue rather than
                // tear the session down.
                Err(err) if is_recoverable_short_buffer(&err) => continue,
                Err(err) => return Err(WaylineError::from(err)),
            }
        }
    }

    async fn send_to(&self, buf: &[u8], destination: NetAddr) -> Result<usize> {
        self.socket
            .send_to(buf, std::net::SocketAddr::from(destination))
            .await
            .map_err(WaylineError::from)
    }

    fn local_addr(&self) -> Option<NetAddr> {
        self.socket.local_addr().ok().map(NetAddr::from)
    }

    async fn close(&self) -> Result<()> {
        // tokio's UdpSocket has no explicit close; dropping it is the
        // close. We have nothing else to release here, but keep the
        // method so callers have a uniform teardown hook regardless of
        // the concrete socket implementation.
        Ok(())
    }
}

fn is_recoverable_short_buffer(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc_message_size_errno) if libc_message_size_errno == MESSAGE_SIZE_ERRNO
    )
}

#[cfg(unix)]
const MESSAGE_SIZE_ERRNO: i32 = 90; // EMSGSIZE on Linux/most unixes
#[cfg(not(unix))]
const MESSAGE_SIZE_ERRNO: i32 = 10040; // WSAEMSGSIZE on Windows
