use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A compact IP+port value, deliberately not a pointer into the network
/// stack's own address representation (spec §4.2) — it is cheap to copy
/// and carries no borrowed lifetime, so it can cross session/channel
/// boundaries freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    ip: IpAddr,
    port: u16,
}

impl NetAddr {
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<NetAddr> for SocketAddr {
    fn from(addr: NetAddr) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}
