//! Packet-proxy interfaces (spec §4.2) and the live-swappable delegate
//! wrapper (spec §4.3) — the abstract vocabulary the IP-device bridge
//! speaks for UDP.

mod addr;
mod bufpool;
mod delegate;

pub use addr::NetAddr;
pub use bufpool::{BufferPool, PooledBuf};
pub use delegate::DelegatePacketProxy;

use async_trait::async_trait;
use std::sync::Arc;

pub type Result<T> = wayline_errors::Result<T>;

/// Delivers responses for one UDP session back toward the original caller.
///
/// `write_from`/`close` mirror the idempotence and borrowing rules of
/// [`PacketRequestSender`]: a payload must not be retained past the call,
/// and only the first `close` call may perform teardown.
#[async_trait]
pub trait PacketResponseReceiver: Send + Sync + 'static {
    async fn write_from(&self, payload: &[u8], source: NetAddr) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Sends outbound datagrams for one UDP session.
///
/// - An empty payload is a no-op, not an error.
/// - `write_to` after `close` fails with `ErrClosed`.
/// - `close` is idempotent at the contract level: the first call returns
///   `Ok(())`; every subsequent call returns `ErrClosed`.
#[async_trait]
pub trait PacketRequestSender: Send + Sync + 'static {
    async fn write_to(&self, payload: &[u8], destination: NetAddr) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Factory of per-flow request senders, keyed by a caller-owned response
/// receiver. Implementations must be safe under concurrent `new_session`
/// calls; sessions are otherwise independent of one another.
#[async_trait]
pub trait PacketProxy: Send + Sync + 'static {
    async fn new_session(
        &self,
        receiver: Arc<dyn PacketResponseReceiver>,
    ) -> Result<Arc<dyn PacketRequestSender>>;
}
