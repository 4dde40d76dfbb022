use crate::{Result, StreamConn};
use async_trait::async_trait;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// An alternate read pipeline spliced in front of a [`StreamConn`]'s own
/// reads (e.g. a Shadowsocks AEAD decryptor, a TLS record reader).
#[async_trait]
pub trait ConnReader: Send + Sync + 'static {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}

/// An alternate write pipeline spliced in front of a [`StreamConn`]'s own
/// writes.
#[async_trait]
pub trait ConnWriter: Send + Sync + 'static {
    async fn write(&self, buf: &[u8]) -> Result<usize>;
}

/// Adapts a base [`StreamConn`] with substitute reader/writer pipelines
/// while delegating close and address semantics to the base connection.
///
/// Build one with [`wrap_conn`], not the constructor directly — that
/// function also collapses nested adapters so wrapping an already-wrapped
/// connection never accumulates layers.
pub struct WrapConn {
    base: Arc<dyn StreamConn>,
    reader: Box<dyn ConnReader>,
    writer: Box<dyn ConnWriter>,
}

impl WrapConn {
    fn new(base: Arc<dyn StreamConn>, reader: Box<dyn ConnReader>, writer: Box<dyn ConnWriter>) -> Self {
        Self { base, reader, writer }
    }
}

#[async_trait]
impl StreamConn for WrapConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.writer.write(buf).await
    }

    async fn close_read(&self) -> Result<()> {
        self.base.close_read().await
    }

    async fn close_write(&self) -> Result<()> {
        self.base.close_write().await
    }

    /// Passed straight through to the base connection: a deadline still
    /// needs to bound the base socket's I/O even though `read`/`write`
    /// themselves go through the substitute pipelines above.
    async fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.base.set_read_deadline(deadline).await
    }

    async fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.base.set_write_deadline(deadline).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.base.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.base.peer_addr()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds a [`StreamConn`] that reads via `reader` and writes via `writer`,
/// while delegating `close_read`, `close_write`, and addresses to `base`.
///
/// If `base` is itself a [`WrapConn`], this unwraps to its underlying base
/// first so adapters never nest — stacking a TLS-fragmentation wrapper on
/// top of an OOB-injection wrapper on top of a Shadowsocks wrapper would
/// otherwise grow a chain of delegated `close_read`/`close_write` calls with
/// no added value.
pub fn wrap_conn(
    base: Arc<dyn StreamConn>,
    reader: Box<dyn ConnReader>,
    writer: Box<dyn ConnWriter>,
) -> Arc<dyn StreamConn> {
    let base = match base.as_any().downcast_ref::<WrapConn>() {
        Some(existing) => Arc::clone(&existing.base),
        None => base,
    };
    Arc::new(WrapConn::new(base, reader, writer))
}
