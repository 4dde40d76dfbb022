//! Stream-connection primitives (spec §4.1): a full-duplex [`StreamConn`]
//! capability with independent half-close, a [`StreamDialer`] that produces
//! them, a [`StreamEndpoint`] that always dials the same address, and the
//! [`WrapConn`] adapter used by higher transports (Shadowsocks framing,
//! TLS-fragmentation, OOB byte injection) to splice in alternate
//! reader/writer pipelines without losing half-close semantics.

mod direct;
mod wrap;

pub use direct::{DirectTcpDialer, TcpSocketConfig, TcpStreamConn};
pub use wrap::{WrapConn, wrap_conn};

use async_trait::async_trait;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use wayline_errors::WaylineError;

pub type Result<T> = wayline_errors::Result<T>;

/// A full-duplex byte stream with independent read/write half-close.
///
/// Closing one half must never close the other: a peer that has finished
/// writing (FIN sent, or the local read half shut down) can still read a
/// trailing response on the other half until it too is closed.
#[async_trait]
pub trait StreamConn: Send + Sync + 'static {
    /// Reads into `buf`, returning the number of bytes read, `Ok(0)` on
    /// EOF, or an error (`ErrClosed` if the read half was already closed).
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf`, returning the number of bytes written (0 for an empty
    /// payload). Fails with `ErrClosed` if the write half was already
    /// closed.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Shuts down the read half. Subsequent `read` calls fail with
    /// `ErrClosed`; the write half is unaffected.
    async fn close_read(&self) -> Result<()>;

    /// Shuts down the write half, signalling FIN to the peer. Subsequent
    /// `write` calls fail with `ErrClosed`; the read half is unaffected.
    async fn close_write(&self) -> Result<()>;

    /// Closes both halves.
    async fn close(&self) -> Result<()> {
        let write_result = self.close_write().await;
        let read_result = self.close_read().await;
        write_result.and(read_result)
    }

    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Sets (or, with `None`, clears) the deadline after which a pending
    /// or future `read` fails. Not every implementation backs a real
    /// socket timeout; the default rejects with `ErrUnsupported` so
    /// implementations opt in rather than silently ignoring a deadline a
    /// caller thinks is in effect.
    async fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Err(WaylineError::unsupported(
            "this StreamConn does not support read deadlines",
        ))
    }

    /// As [`StreamConn::set_read_deadline`], for `write`.
    async fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Err(WaylineError::unsupported(
            "this StreamConn does not support write deadlines",
        ))
    }

    /// Enables [`wrap_conn`] to detect and unwrap an already-adapted
    /// connection so adapters never nest.
    fn as_any(&self) -> &dyn Any;
}

/// Capability: dials `host:port` and returns a [`StreamConn`].
#[async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> Result<Arc<dyn StreamConn>>;
}

/// A dialer bound to one fixed address.
#[derive(Clone)]
pub struct StreamEndpoint {
    dialer: Arc<dyn StreamDialer>,
    address: String,
}

impl StreamEndpoint {
    pub fn new(dialer: Arc<dyn StreamDialer>, address: impl Into<String>) -> Self {
        Self {
            dialer,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn connect(&self) -> Result<Arc<dyn StreamConn>> {
        self.dialer.dial(&self.address).await
    }
}
