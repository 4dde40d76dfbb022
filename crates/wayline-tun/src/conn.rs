use crate::worker::Shared;
use async_trait::async_trait;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wayline_errors::WaylineError;
use wayline_stream::{Result, StreamConn};

/// A [`StreamConn`] backed by one smoltcp TCP socket: the device side of
/// an accepted TUN connection, bridged by the caller's bidirectional
/// relay to whatever the configured `StreamDialer` dialed.
pub struct StackTcpConn {
    shared: Arc<Shared>,
    handle: SocketHandle,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_closed: AtomicBool,
}

impl StackTcpConn {
    pub(crate) fn new(
        shared: Arc<Shared>,
        handle: SocketHandle,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            shared,
            handle,
            local_addr,
            peer_addr,
            read_closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StreamConn for StackTcpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.read_closed.load(Ordering::SeqCst) {
                return Err(WaylineError::closed("stack connection read half closed"));
            }
            {
                let mut inner = self.shared.inner.lock().await;
                let socket = inner.sockets.get_mut::<tcp::Socket>(self.handle);
                if socket.can_recv() {
                    let n = socket
                        .recv_slice(buf)
                        .map_err(|e| WaylineError::unsupported(e.to_string()))?;
                    drop(inner);
                    self.shared.wake();
                    return Ok(n);
                }
                if !socket.may_recv() {
                    return Ok(0);
                }
            }
            self.shared.progress.notified().await;
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.shared.inner.lock().await;
                let socket = inner.sockets.get_mut::<tcp::Socket>(self.handle);
                if !socket.may_send() {
                    return Err(WaylineError::closed("stack connection write half closed"));
                }
                if socket.can_send() {
                    let n = socket
                        .send_slice(buf)
                        .map_err(|e| WaylineError::unsupported(e.to_string()))?;
                    drop(inner);
                    self.shared.wake();
                    return Ok(n);
                }
            }
            self.shared.progress.notified().await;
        }
    }

    async fn close_read(&self) -> Result<()> {
        self.read_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_write(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let socket = inner.sockets.get_mut::<tcp::Socket>(self.handle);
        socket.close();
        drop(inner);
        self.shared.wake();
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
