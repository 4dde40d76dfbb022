//! Turns a connection-oriented [`PacketListener`] — a factory for
//! bidirectional UDP sockets, the natural shape of a Shadowsocks UDP
//! client — into a session-oriented [`PacketProxy`] (spec §4.4).

mod adapter;
mod socket;

pub use adapter::{PacketListenerProxy, PacketListenerProxyConfig};
pub use socket::{DatagramSocket, PacketListener, UdpPacketListener};

pub type Result<T> = wayline_errors::Result<T>;
