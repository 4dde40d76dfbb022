use crate::{PacketProxy, PacketRequestSender, PacketResponseReceiver, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use wayline_errors::WaylineError;

/// A [`PacketProxy`] whose inner proxy can be swapped at runtime (spec
/// §4.3) — the mechanism that lets a client flip its UDP path between a
/// real remote proxy and the local DNS-truncation fallback without
/// disturbing sessions already in flight.
///
/// The inner proxy is held behind an [`ArcSwap`] rather than a mutex: a
/// `new_session` call loads the current proxy with a single atomic
/// acquire, so swap contention never blocks session creation, and a
/// `set_proxy` that happens-before a `new_session` call is guaranteed to
/// be observed by it (release/acquire on the atomic pointer). Existing
/// sessions are unaffected by a later swap — they already hold the
/// `PacketRequestSender` returned by the proxy that was current when they
/// were created.
pub struct DelegatePacketProxy {
    inner: ArcSwap<dyn PacketProxy>,
}

impl DelegatePacketProxy {
    /// Constructs a delegate around `initial`. Construction with no inner
    /// proxy is a programmer error in Go; in Rust the type system already
    /// forbids a null `Arc`, so this constructor is infallible. Use
    /// [`DelegatePacketProxy::try_new`] when the inner proxy is itself
    /// optional at the call site (e.g. parsed from configuration) and the
    /// absent case should surface as a `Result` rather than a panic.
    pub fn new(initial: Arc<dyn PacketProxy>) -> Self {
        Self {
            inner: ArcSwap::new(initial),
        }
    }

    pub fn try_new(initial: Option<Arc<dyn PacketProxy>>) -> Result<Self> {
        let initial = initial.ok_or_else(|| {
            WaylineError::unsupported("delegate packet proxy requires a non-nil inner proxy")
        })?;
        Ok(Self::new(initial))
    }

    /// Installs `new_proxy` for all future `new_session` calls. Sessions
    /// already in progress keep their existing sender.
    pub fn set_proxy(&self, new_proxy: Arc<dyn PacketProxy>) {
        self.inner.store(new_proxy);
        debug!(target: "wayline::packet", "delegate packet proxy swapped inner proxy");
    }

    /// As [`DelegatePacketProxy::set_proxy`], but rejects an absent proxy
    /// (mirrors the Go contract's `SetProxy(nil)` error) and leaves the
    /// previously installed proxy in place.
    pub fn try_set_proxy(&self, new_proxy: Option<Arc<dyn PacketProxy>>) -> Result<()> {
        match new_proxy {
            Some(proxy) => {
                self.set_proxy(proxy);
                Ok(())
            }
            None => Err(WaylineError::unsupported(
                "set_proxy requires a non-nil inner proxy; previous proxy left installed",
            )),
        }
    }

    /// Snapshot of the inner proxy currently observed by new sessions.
    pub fn current(&self) -> Arc<dyn PacketProxy> {
        self.inner.load_full()
    }
}

#[async_trait]
impl PacketProxy for DelegatePacketProxy {
    async fn new_session(
        &self,
        receiver: Arc<dyn PacketResponseReceiver>,
    ) -> Result<Arc<dyn PacketRequestSender>> {
        let proxy = self.inner.load_full();
        proxy.new_session(receiver).await
    }
}
