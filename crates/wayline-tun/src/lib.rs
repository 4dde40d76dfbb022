//! The IP device bridging raw IP packets to a user-space network stack
//! (spec §4.5) — the component this crate's implementation budget is
//! dominated by. [`IpDevice`] takes a `StreamDialer` and a `PacketProxy`
//! and exposes a `read`/`write`-able endpoint for raw IP packets: TCP
//! connections the stack accepts are dialed through the stream dialer and
//! bidirectionally relayed; UDP datagrams become `PacketProxy` sessions.
//!
//! Internally this drives a `smoltcp` interface rather than lwIP (see
//! `SPEC_FULL.md` §A for why) — UDP is handled by hand-parsing datagrams
//! out of raw IP packets rather than through smoltcp's own UDP socket
//! layer (see `packet.rs`), since a wildcard UDP bind covering every
//! destination port a tunneled app might use isn't practical through
//! smoltcp's socket API. The public contract — one live device per
//! process, MTU-gated writes, EOF/`ErrClosed` semantics, and an
//! unbuffered output channel that sequentializes stack writes and
//! provides backpressure — matches the spec.

mod conn;
mod device;
mod packet;
mod relay;
mod udp;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use wayline_errors::WaylineError;
use wayline_packet::PacketProxy;
use wayline_stream::StreamDialer;

pub type Result<T> = wayline_errors::Result<T>;

/// Fixed maximum IP packet length every [`IpDevice`] accepts or emits.
pub const MTU: usize = 1500;

/// Tracks whether a live [`IpDevice`] already exists in this process.
///
/// The wrapped stack library is a process singleton by construction (spec
/// §4.5, §9): a second concurrently-open device is a programmer error we
/// can catch at construction time rather than letting it corrupt shared
/// stack state.
static DEVICE_LIVE: AtomicBool = AtomicBool::new(false);

/// A read/write endpoint carrying raw IP packets, backed by an in-process
/// user-space TCP/IP stack.
///
/// Concurrency contract: at most one task may call [`IpDevice::write`] at
/// a time, at most one may call [`IpDevice::read`] or
/// [`IpDevice::write_to`] at a time, and at most one may call
/// [`IpDevice::close`]. Calling `read`/`write_to` from two tasks
/// concurrently is safe (an internal lock serializes them) but defeats
/// the one-packet-per-call contract the stack relies on, so callers
/// should not do it.
pub struct IpDevice {
    shared: Arc<worker::Shared>,
    output_rx: AsyncMutex<mpsc::Receiver<worker::OutputItem>>,
    closed: AtomicBool,
}

impl IpDevice {
    /// Builds a device that dials TCP connections through `stream_dialer`
    /// and opens UDP sessions against `packet_proxy`.
    ///
    /// Fails if another `IpDevice` is already open in this process; close
    /// it first. This mirrors the lwIP bindings' single global netif
    /// stack, so reimplementing on top of a library (`smoltcp`) that
    /// would otherwise happily support multiple independent interfaces
    /// does not silently change the contract callers built against.
    pub fn new(stream_dialer: Arc<dyn StreamDialer>, packet_proxy: Arc<dyn PacketProxy>) -> Result<Self> {
        if DEVICE_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WaylineError::unsupported(
                "an IpDevice is already open in this process; close it before constructing another",
            ));
        }
        let (shared, output_rx) = worker::spawn(stream_dialer, packet_proxy);
        Ok(Self {
            shared,
            output_rx: AsyncMutex::new(output_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// The fixed maximum IP packet length this device accepts or emits.
    pub const fn mtu(&self) -> usize {
        MTU
    }

    /// Hands one raw IP packet to the stack.
    ///
    /// Fails with `ErrMsgSize` (no bytes accepted) if `buf` is longer than
    /// [`IpDevice::mtu`], or `ErrClosed` if the device has been closed.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WaylineError::closed("IP device closed"));
        }
        if buf.len() > MTU {
            return Err(WaylineError::msg_size(buf.len(), MTU));
        }
        worker::handle_inbound(&self.shared, buf.to_vec()).await
    }

    /// Reads one IP packet the stack produced into `buf`.
    ///
    /// Packets longer than `buf` are truncated: the excess is discarded
    /// without error. Returns `Ok(0)` once the device is closed and no
    /// further packets will arrive (EOF).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        // The output channel's `Sender` lives inside `self.shared`, which
        // this device keeps alive for as long as it exists, so `close`
        // never drops it and `rx.recv()` alone would never observe EOF.
        // Race it against the shutdown signal instead; checking `closed`
        // before creating the `notified()` future (rather than after)
        // avoids missing a shutdown that raced in concurrently.
        if self.shared.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        let shutdown = self.shared.shutdown.notified();
        let mut rx = self.output_rx.lock().await;
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    let n = item.packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&item.packet[..n]);
                    let _ = item.ack.send(Ok(n));
                    Ok(n)
                }
                None => Ok(0),
            },
            _ = shutdown => Ok(0),
        }
    }

    /// Zero-copy variant of [`IpDevice::read`]: writes each packet the
    /// stack produces directly to `dst`, one at a time, until the device
    /// is closed.
    pub async fn write_to<W>(&self, dst: &mut W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut rx = self.output_rx.lock().await;
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let shutdown = self.shared.shutdown.notified();
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        let len = item.packet.len();
                        match dst.write_all(&item.packet).await {
                            Ok(()) => {
                                let _ = item.ack.send(Ok(len));
                            }
                            Err(err) => {
                                let _ = item
                                    .ack
                                    .send(Err(WaylineError::closed("output destination write failed")));
                                return Err(WaylineError::from(err));
                            }
                        }
                    }
                    None => return Ok(()),
                },
                _ = shutdown => return Ok(()),
            }
        }
    }

    /// Closes the device: subsequent `read`s return EOF, subsequent
    /// `write`s fail with `ErrClosed`, and any call blocked waiting on
    /// stack output unblocks with `ErrClosed`. Idempotent; only the first
    /// call tears anything down, matching the spec's "done channel"
    /// design where closing unblocks both ends without a race between
    /// them.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();
        DEVICE_LIVE.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for IpDevice {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.closed.store(true, Ordering::SeqCst);
            self.shared.shutdown.notify_waiters();
            DEVICE_LIVE.store(false, Ordering::Release);
        }
    }
}
