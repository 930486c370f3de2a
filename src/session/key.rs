//! Endpoint and session key value types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use serde::{Deserialize, Serialize};

/// Address family of an endpoint or socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 (`AF_INET`)
    Ipv4,
    /// IPv6 (`AF_INET6`)
    Ipv6,
}

impl AddressFamily {
    /// Family of an IP address
    #[must_use]
    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Unspecified ("any") address of this family
    #[must_use]
    pub const fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Raw `AF_*` constant
    #[must_use]
    pub const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Ipv4 => libc::AF_INET,
            Self::Ipv6 => libc::AF_INET6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// An (address, port) pair. Immutable once constructed.
///
/// IPv6 endpoints carry no flow label or scope id: two endpoints are equal
/// exactly when their address and port are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Create an endpoint from an address and port
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Address part
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Port part
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Address family, derived from the address
    #[must_use]
    pub const fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.0.ip())
    }

    /// Host part as a string, without brackets
    #[must_use]
    pub fn host(&self) -> String {
        self.0.ip().to_string()
    }

    /// `host:port` form, with IPv6 hosts in brackets
    #[must_use]
    pub fn host_port(&self) -> String {
        self.0.to_string()
    }

    /// The endpoint as a standard socket address
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self(addr),
            SocketAddr::V6(v6) => Self(SocketAddr::V6(SocketAddrV6::new(
                *v6.ip(),
                v6.port(),
                0,
                0,
            ))),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one UDP flow: the client endpoint and the destination it dialed.
///
/// Packets with the same endpoint pair always map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// Client (source) endpoint
    pub local: Endpoint,
    /// Original destination endpoint
    pub remote: Endpoint,
}

impl SessionKey {
    /// Create a key from a (local, remote) endpoint pair
    #[must_use]
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.local, self.remote)
    }
}
