use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};

/// A remote endpoint: address + port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTarget {
    address: IpAddr,
    port: u16,
}

impl ConnectionTarget {
    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse a literal IP (`"127.0.0.1"`, `"::1"`) and pair it with `port`.
    pub fn parse(address: &str, port: u16) -> Result<Self, AddrParseError> {
        Ok(Self::new(address.trim().parse()?, port))
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// `address:port`, the key used for per-peer state.
    pub fn qualified_name(&self) -> String {
        self.socket_addr().to_string()
    }

    /// Same address, port shifted by `offset` (UDP runs at TCP port + 1).
    pub fn with_port_offset(&self, offset: u16) -> Option<Self> {
        self.port
            .checked_add(offset)
            .map(|port| Self::new(self.address, port))
    }

    /// Whether an observed sender is this target.
    pub fn matches(&self, from: &SocketAddr) -> bool {
        from.port() == self.port && canonical(from.ip()) == canonical(self.address)
    }
}

/// IPv4-mapped IPv6 senders compare equal to their IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

impl From<SocketAddr> for ConnectionTarget {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
