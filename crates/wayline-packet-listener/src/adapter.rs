use crate::socket::{DatagramSocket, PacketListener};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};
use wayline_errors::WaylineError;
use wayline_packet::{
    BufferPool, NetAddr, PacketProxy, PacketRequestSender, PacketResponseReceiver,
};

const DEFAULT_WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_BUFFER_CAPACITY: usize = 2 * 1024;
const BUFFER_POOL_SHARDS: usize = 16;

/// Tuning knobs for [`PacketListenerProxy`].
#[derive(Clone, Debug)]
pub struct PacketListenerProxyConfig {
    /// A session with no outbound write in this long is closed. The
    /// teardown itself may take up to roughly twice this long, since the
    /// watchdog only checks after each idle period elapses uninterrupted.
    pub write_idle_timeout: Duration,
    pub read_buffer_capacity: usize,
}

impl Default for PacketListenerProxyConfig {
    fn default() -> Self {
        Self {
            write_idle_timeout: DEFAULT_WRITE_IDLE_TIMEOUT,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
        }
    }
}

/// Adapts a connection-oriented [`PacketListener`] into a session-oriented
/// [`PacketProxy`] (spec §4.4): each `new_session` call opens one socket
/// from the listener and keeps it alive only as long as the caller keeps
/// writing to it.
pub struct PacketListenerProxy {
    listener: Arc<dyn PacketListener>,
    config: PacketListenerProxyConfig,
    buffers: Arc<BufferPool>,
}

impl PacketListenerProxy {
    pub fn new(listener: Arc<dyn PacketListener>) -> Self {
        Self::with_config(listener, PacketListenerProxyConfig::default())
    }

    pub fn with_config(listener: Arc<dyn PacketListener>, config: PacketListenerProxyConfig) -> Self {
        let buffers = Arc::new(BufferPool::new(config.read_buffer_capacity, BUFFER_POOL_SHARDS));
        Self {
            listener,
            config,
            buffers,
        }
    }
}

#[async_trait]
impl PacketProxy for PacketListenerProxy {
    async fn new_session(
        &self,
        receiver: Arc<dyn PacketResponseReceiver>,
    ) -> Result<Arc<dyn PacketRequestSender>> {
        let socket = self.listener.listen_packet().await?;
        let session = Arc::new(ListenerSession {
            socket,
            receiver,
            closed: AtomicBool::new(false),
            idle_reset: Notify::new(),
            shutdown: Notify::new(),
        });

        tokio::spawn(reader_task(session.clone(), self.buffers.clone()));
        tokio::spawn(watchdog_task(session.clone(), self.config.write_idle_timeout));

        Ok(session as Arc<dyn PacketRequestSender>)
    }
}

struct ListenerSession {
    socket: Arc<dyn DatagramSocket>,
    receiver: Arc<dyn PacketResponseReceiver>,
    closed: AtomicBool,
    idle_reset: Notify,
    /// Signalled by `close_once` to cancel a `reader_task` blocked in
    /// `recv_from` on a socket whose own `close` has nothing to cancel
    /// it with (a no-op for a tokio `UdpSocket`, for instance).
    shutdown: Notify,
}

impl ListenerSession {
    /// Marks the session closed and releases the underlying socket and
    /// receiver. Returns `true` only for the call that performed teardown.
    async fn close_once(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.notify_waiters();
        let _ = self.socket.close().await;
        let _ = self.receiver.close().await;
        true
    }
}

async fn reader_task(session: Arc<ListenerSession>, buffers: Arc<BufferPool>) {
    let key = Arc::as_ptr(&session) as u64;
    loop {
        if session.closed.load(Ordering::SeqCst) {
            return;
        }
        let shutdown = session.shutdown.notified();
        let mut buf = buffers.acquire(key);
        tokio::select! {
            result = session.socket.recv_from(&mut buf) => match result {
                Ok((n, source)) => {
                    if let Err(err) = session.receiver.write_from(&buf[..n], source).await {
                        warn!(error = %err, "packet-listener session: response receiver rejected datagram");
                        session.close_once().await;
                        return;
                    }
                }
                Err(err) if err.kind() == wayline_errors::ErrorKind::Closed => {
                    session.close_once().await;
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "packet-listener session: read failed, closing");
                    session.close_once().await;
                    return;
                }
            },
            _ = shutdown => return,
        }
    }
}

async fn watchdog_task(session: Arc<ListenerSession>, write_idle_timeout: Duration) {
    loop {
        if timeout(write_idle_timeout, session.idle_reset.notified())
            .await
            .is_err()
        {
            // No write arrived within the idle window; the session is
            // considered abandoned.
            session.close_once().await;
            return;
        }
        if session.closed.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[async_trait]
impl PacketRequestSender for ListenerSession {
    async fn write_to(&self, payload: &[u8], destination: NetAddr) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WaylineError::closed("session already closed"));
        }
        if payload.is_empty() {
            self.idle_reset.notify_one();
            return Ok(());
        }
        let result = self.socket.send_to(payload, destination).await;
        self.idle_reset.notify_one();
        result.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if self.close_once().await {
            Ok(())
        } else {
            Err(WaylineError::closed("session already closed"))
        }
    }
}
