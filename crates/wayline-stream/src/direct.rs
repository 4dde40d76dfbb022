use crate::{Result, StreamConn, StreamDialer};
use async_trait::async_trait;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use wayline_errors::{ErrorKind, WaylineError};

/// Races `fut` against `deadline` (if set), mapping an elapsed deadline to
/// an `ErrorKind::Other` failure rather than `ErrClosed` — a deadline
/// firing is not the same as the connection being closed.
async fn run_with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(deadline) => {
            match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut).await {
                Ok(result) => result.map_err(WaylineError::from),
                Err(_) => Err(WaylineError::new(ErrorKind::Other, "deadline exceeded")),
            }
        }
        None => fut.await.map_err(WaylineError::from),
    }
}

/// Socket-level knobs applied to every connection a [`DirectTcpDialer`]
/// produces. Kept as an explicit, cloneable config rather than scattering
/// raw `socket2` calls through call sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: false,
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let sock = socket2::SockRef::from(stream);
        sock.set_linger(self.linger)
    }
}

/// A direct, un-proxied TCP [`StreamDialer`]. This is the innermost dialer
/// every higher-level transport (Shadowsocks, TLS-fragmentation,
/// Happy-Eyeballs) ultimately bottoms out on.
#[derive(Clone, Default)]
pub struct DirectTcpDialer {
    config: TcpSocketConfig,
}

impl DirectTcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamDialer for DirectTcpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn StreamConn>> {
        let stream = TcpStream::connect(address).await.map_err(WaylineError::from)?;
        self.config.apply(&stream).map_err(WaylineError::from)?;
        let local_addr = stream.local_addr().map_err(WaylineError::from)?;
        let peer_addr = stream.peer_addr().map_err(WaylineError::from)?;
        let (read_half, write_half) = stream.into_split();
        debug!(target: "wayline::stream", %local_addr, %peer_addr, "dialed direct TCP connection");
        Ok(Arc::new(TcpStreamConn::from_halves(
            read_half, write_half, local_addr, peer_addr,
        )))
    }
}

/// A [`StreamConn`] backed by a split `tokio::net::TcpStream`.
///
/// The read and write halves are guarded by independent mutexes (rather
/// than one mutex around the whole stream) so a concurrent reader and
/// writer never block each other — required for the bidirectional relay
/// in `wayline-tun` to make progress in both directions at once.
pub struct TcpStreamConn {
    read_half: AsyncMutex<OwnedReadHalf>,
    write_half: AsyncMutex<OwnedWriteHalf>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpStreamConn {
    pub fn from_halves(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            local_addr,
            peer_addr,
        }
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr().map_err(WaylineError::from)?;
        let peer_addr = stream.peer_addr().map_err(WaylineError::from)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(read_half, write_half, local_addr, peer_addr))
    }
}

#[async_trait]
impl StreamConn for TcpStreamConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.read_closed.load(Ordering::Acquire) {
            return Err(WaylineError::closed("read half already closed"));
        }
        let deadline = *self.read_deadline.lock().unwrap();
        let mut guard = self.read_half.lock().await;
        run_with_deadline(deadline, guard.read(buf)).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.write_closed.load(Ordering::Acquire) {
            return Err(WaylineError::closed("write half already closed"));
        }
        let deadline = *self.write_deadline.lock().unwrap();
        let mut guard = self.write_half.lock().await;
        run_with_deadline(deadline, guard.write(buf)).await
    }

    async fn close_read(&self) -> Result<()> {
        self.read_closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn close_write(&self) -> Result<()> {
        if self.write_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.write_half.lock().await;
        guard.shutdown().await.map_err(WaylineError::from)
    }

    async fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.read_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    async fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.write_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
