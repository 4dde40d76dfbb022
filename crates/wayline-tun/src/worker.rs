use crate::conn::StackTcpConn;
use crate::device::ChannelDevice;
use crate::packet::{self, ParsedUdp};
use crate::udp::StackUdpReceiver;
use dashmap::DashMap;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpListenEndpoint, Ipv4Address, Ipv6Address};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};
use wayline_errors::WaylineError;
use wayline_packet::{NetAddr, PacketProxy, PacketResponseReceiver};
use wayline_stream::{StreamConn, StreamDialer};

use crate::MTU;

const TCP_BUFFER_SIZE: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct OutputItem {
    pub packet: Vec<u8>,
    pub ack: oneshot::Sender<wayline_errors::Result<usize>>,
}

/// Which side of a TCP flow's lifecycle a tracked socket is in: still
/// waiting for the handshake to finish, or already handed off to a
/// [`StackTcpConn`] and only being watched here so its socket gets
/// reclaimed once the connection closes.
enum FlowState {
    Pending,
    Accepted,
}

struct TrackedFlow {
    handle: SocketHandle,
    state: FlowState,
}

pub(crate) struct Inner {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: ChannelDevice,
    /// One entry per TCP flow seen since the last time it fully closed,
    /// keyed by (client, server) so a client reusing the same source
    /// port against a different destination isn't conflated with an
    /// existing flow.
    tcp_flows: HashMap<(SocketAddr, SocketAddr), TrackedFlow>,
}

/// State shared between the background poll loop, every accepted
/// [`StackTcpConn`], and every [`StackUdpReceiver`].
pub(crate) struct Shared {
    pub(crate) inner: AsyncMutex<Inner>,
    pub(crate) progress: Notify,
    pub(crate) shutdown: Notify,
    pub(crate) closed: AtomicBool,
    pub(crate) udp_sessions: DashMap<SocketAddr, Arc<dyn wayline_packet::PacketRequestSender>>,
    stream_dialer: Arc<dyn StreamDialer>,
    packet_proxy: Arc<dyn PacketProxy>,
    output_tx: mpsc::Sender<OutputItem>,
    start: StdInstant,
}

impl Shared {
    pub(crate) fn wake(&self) {
        self.progress.notify_waiters();
    }

    /// Milliseconds since this device started, the monotonic clock
    /// smoltcp's `Interface::poll` requires — unlike a wall-clock
    /// reading, it can never jump backwards under an NTP step or a
    /// manual clock adjustment.
    fn monotonic_millis(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    pub(crate) async fn enqueue_outbound(&self, packet: Vec<u8>) -> wayline_errors::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WaylineError::closed("device closed"));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            sent = self.output_tx.send(OutputItem { packet, ack: ack_tx }) => {
                if sent.is_err() {
                    return Err(WaylineError::closed("device closed"));
                }
            }
            _ = self.shutdown.notified() => {
                return Err(WaylineError::closed("device closed"));
            }
        }
        tokio::select! {
            ack = ack_rx => match ack {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(WaylineError::closed("device closed")),
            },
            _ = self.shutdown.notified() => Err(WaylineError::closed("device closed")),
        }
    }
}

fn to_smoltcp_addr(ip: std::net::IpAddr) -> IpAddress {
    match ip {
        std::net::IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address(v4.octets())),
        std::net::IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address(v6.octets())),
    }
}

/// Builds a TCP socket listening on the exact destination `dst` a SYN
/// targeted. smoltcp has no "accept any port" mode — `listen` rejects
/// port 0 outright — so every destination this device should be able to
/// catch needs its own socket bound to that destination, created the
/// moment a SYN for it is first seen (mirrors how `dispatch_udp` creates
/// a session the moment a new UDP flow is first seen). `set_any_ip` on
/// the interface is what lets a destination address not otherwise
/// configured on this interface still be accepted.
fn new_listen_socket(dst: SocketAddr) -> Option<tcp::Socket<'static>> {
    if dst.port() == 0 {
        return None;
    }
    let rx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
    let tx_buffer = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
    let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
    let endpoint = IpListenEndpoint {
        addr: Some(to_smoltcp_addr(dst.ip())),
        port: dst.port(),
    };
    match socket.listen(endpoint) {
        Ok(()) => Some(socket),
        Err(err) => {
            warn!(%dst, error = %err, "tun: failed to listen for new TCP flow");
            None
        }
    }
}

/// Builds the interface and socket set and spawns the background task
/// that drives them. TCP listen sockets are created on demand as SYNs
/// arrive, not pre-populated here. Returns the state other parts of
/// this crate need to hand it work.
pub(crate) fn spawn(
    stream_dialer: Arc<dyn StreamDialer>,
    packet_proxy: Arc<dyn PacketProxy>,
) -> (Arc<Shared>, mpsc::Receiver<OutputItem>) {
    let mut device = ChannelDevice::new(MTU);
    let config = Config::new(HardwareAddress::Ip);
    let mut iface = Interface::new(config, &mut device, SmolInstant::from_millis(0));
    iface.set_any_ip(true);

    let sockets = SocketSet::new(Vec::new());

    let inner = Inner {
        iface,
        sockets,
        device,
        tcp_flows: HashMap::new(),
    };

    let (output_tx, output_rx) = mpsc::channel(1);

    let shared = Arc::new(Shared {
        inner: AsyncMutex::new(inner),
        progress: Notify::new(),
        shutdown: Notify::new(),
        closed: AtomicBool::new(false),
        udp_sessions: DashMap::new(),
        stream_dialer,
        packet_proxy,
        output_tx,
        start: StdInstant::now(),
    });

    tokio::spawn(run(shared.clone()));

    (shared, output_rx)
}

struct AcceptedTcp {
    handle: SocketHandle,
    dial_target: SocketAddr,
    client_addr: SocketAddr,
}

async fn run(shared: Arc<Shared>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let (accepted, outbound) = {
            let mut inner = shared.inner.lock().await;
            let timestamp = SmolInstant::from_millis(shared.monotonic_millis());
            inner.iface.poll(timestamp, &mut inner.device, &mut inner.sockets);

            let accepted = service_tcp_flows(&mut inner);

            let mut outbound = Vec::new();
            while let Some(pkt) = inner.device.pop_outbound() {
                outbound.push(pkt);
            }
            (accepted, outbound)
        };

        shared.wake();

        for pkt in outbound {
            if shared.enqueue_outbound(pkt).await.is_err() {
                return;
            }
        }

        for accepted in accepted {
            spawn_accepted_tcp(shared.clone(), accepted);
        }

        tokio::select! {
            _ = shared.progress.notified() => {}
            _ = shared.shutdown.notified() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Walks every tracked TCP flow once per poll: a `Pending` socket whose
/// handshake has finished is handed off as an [`AcceptedTcp`] exactly
/// once; any socket (pending or already accepted) that has fully closed
/// is dropped from both the tracking map and the socket set, so a flow
/// that never completes its handshake, or a connection the peer or the
/// relay has finished with, doesn't hold a socket forever.
fn service_tcp_flows(inner: &mut Inner) -> Vec<AcceptedTcp> {
    let mut accepted = Vec::new();
    let mut finished = Vec::new();

    for (&flow_key, flow) in inner.tcp_flows.iter_mut() {
        let socket = inner.sockets.get::<tcp::Socket>(flow.handle);
        match flow.state {
            FlowState::Pending => {
                if socket.state() == tcp::State::Closed {
                    finished.push(flow_key);
                } else if socket.is_active() && socket.state() != tcp::State::Listen {
                    let local = socket.local_endpoint();
                    let remote = socket.remote_endpoint();
                    if let (Some(local), Some(remote)) = (local, remote) {
                        if let (Ok(dial_target), Ok(client_addr)) =
                            (to_socket_addr(local), to_socket_addr(remote))
                        {
                            accepted.push(AcceptedTcp {
                                handle: flow.handle,
                                dial_target,
                                client_addr,
                            });
                            flow.state = FlowState::Accepted;
                        }
                    }
                }
            }
            FlowState::Accepted => {
                if socket.state() == tcp::State::Closed {
                    finished.push(flow_key);
                }
            }
        }
    }

    for flow_key in finished {
        if let Some(flow) = inner.tcp_flows.remove(&flow_key) {
            inner.sockets.remove(flow.handle);
        }
    }

    accepted
}

fn to_socket_addr(endpoint: smoltcp::wire::IpEndpoint) -> Result<SocketAddr, ()> {
    let ip = match endpoint.addr {
        smoltcp::wire::IpAddress::Ipv4(v4) => std::net::IpAddr::V4(std::net::Ipv4Addr::from(v4.0)),
        smoltcp::wire::IpAddress::Ipv6(v6) => std::net::IpAddr::V6(std::net::Ipv6Addr::from(v6.0)),
    };
    Ok(SocketAddr::new(ip, endpoint.port))
}

fn spawn_accepted_tcp(shared: Arc<Shared>, accepted: AcceptedTcp) {
    let conn: Arc<dyn StreamConn> = Arc::new(StackTcpConn::new(
        shared.clone(),
        accepted.handle,
        accepted.dial_target,
        accepted.client_addr,
    ));
    let dialer = shared.stream_dialer.clone();
    tokio::spawn(async move {
        match dialer.dial(&accepted.dial_target.to_string()).await {
            Ok(remote) => {
                crate::relay::bidirectional_relay(conn, remote).await;
            }
            Err(err) => {
                debug!(target = %accepted.dial_target, error = %err, "tun: dial failed, rejecting TUN-side connection");
                let _ = conn.close().await;
            }
        }
    });
}

/// Parses one raw IP packet written by the caller. UDP datagrams are
/// dispatched straight to the session table; everything else (TCP, most
/// notably) is handed to the stack for reassembly.
pub(crate) async fn handle_inbound(shared: &Arc<Shared>, data: Vec<u8>) -> wayline_errors::Result<()> {
    if let Some(parsed) = packet::parse_udp(&data) {
        dispatch_udp(shared, parsed, &data).await
    } else {
        let mut inner = shared.inner.lock().await;
        if let Some(syn) = packet::parse_tcp_syn(&data) {
            let flow_key = (syn.src, syn.dst);
            if !inner.tcp_flows.contains_key(&flow_key) {
                if let Some(socket) = new_listen_socket(syn.dst) {
                    let handle = inner.sockets.add(socket);
                    inner.tcp_flows.insert(
                        flow_key,
                        TrackedFlow {
                            handle,
                            state: FlowState::Pending,
                        },
                    );
                }
            }
        }
        inner.device.push_inbound(data);
        drop(inner);
        shared.wake();
        Ok(())
    }
}

async fn dispatch_udp(
    shared: &Arc<Shared>,
    parsed: ParsedUdp,
    data: &[u8],
) -> wayline_errors::Result<()> {
    let payload = &data[parsed.payload_start..parsed.payload_end];

    let sender = if let Some(existing) = shared.udp_sessions.get(&parsed.src) {
        existing.value().clone()
    } else {
        let receiver: Arc<dyn PacketResponseReceiver> =
            Arc::new(StackUdpReceiver::new(shared.clone(), parsed.src));
        let new_sender = shared.packet_proxy.new_session(receiver.clone()).await?;
        match shared.udp_sessions.entry(parsed.src) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                // Another inbound packet raced us to create this session;
                // keep whichever one won and discard ours.
                let _ = new_sender.close().await;
                occupied.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(new_sender.clone());
                new_sender
            }
        }
    };

    let dest = NetAddr::from(parsed.dst);
    if let Err(err) = sender.write_to(payload, dest).await {
        if err.kind() == wayline_errors::ErrorKind::Closed {
            shared.udp_sessions.remove(&parsed.src);
        } else {
            warn!(peer = %parsed.src, error = %err, "tun: UDP session write failed");
        }
        return Err(err);
    }
    Ok(())
}
