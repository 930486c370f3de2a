//! Original destination resolution for redirected stream connections
//!
//! When iptables redirects a TCP connection, the kernel remembers where the
//! client was originally going. It is recovered with `getsockopt`, trying
//! the IPv6 query first and the IPv4 query second. The first strategy that
//! succeeds wins.

use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Instant;

use socket2::{SockRef, Type};
use tokio::net::TcpStream;
use tracing::debug;

use super::socket::{IP6T_SO_ORIGINAL_DST, SO_ORIGINAL_DST};
use crate::error::ResolutionError;
use crate::session::{AddressFamily, Endpoint};

/// One way of asking the kernel for the original destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// `IP6T_SO_ORIGINAL_DST` at `SOL_IPV6`, decoded as `sockaddr_in6`
    Ipv6,
    /// `SO_ORIGINAL_DST` at `SOL_IP`, decoded as `sockaddr_in`
    Ipv4,
}

/// Strategies in the order they are attempted
pub const RESOLVE_ORDER: [ResolveStrategy; 2] = [ResolveStrategy::Ipv6, ResolveStrategy::Ipv4];

impl ResolveStrategy {
    const fn family(self) -> AddressFamily {
        match self {
            Self::Ipv6 => AddressFamily::Ipv6,
            Self::Ipv4 => AddressFamily::Ipv4,
        }
    }

    const fn option(self) -> (libc::c_int, libc::c_int) {
        match self {
            Self::Ipv6 => (libc::SOL_IPV6, IP6T_SO_ORIGINAL_DST),
            Self::Ipv4 => (libc::SOL_IP, SO_ORIGINAL_DST),
        }
    }

    /// Run this strategy against `fd`.
    ///
    /// A reply whose address family differs from the strategy's is a failure.
    #[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
    pub fn query<F: AsFd>(self, fd: &F) -> io::Result<Endpoint> {
        let (level, name) = self.option();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd.as_fd().as_raw_fd(),
                level,
                name,
                std::ptr::addr_of_mut!(storage).cast::<libc::c_void>(),
                &raw mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let expected = self.family().as_raw();
        if libc::c_int::from(storage.ss_family) != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "kernel returned family {} for {} query",
                    storage.ss_family,
                    self.family()
                ),
            ));
        }

        sockaddr_to_endpoint(&storage, len as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short sockaddr"))
    }
}

impl fmt::Display for ResolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv6 => write!(f, "IP6T_SO_ORIGINAL_DST"),
            Self::Ipv4 => write!(f, "SO_ORIGINAL_DST"),
        }
    }
}

/// Decode a kernel `sockaddr_storage` holding an `AF_INET`/`AF_INET6` address.
///
/// Returns `None` for other families or if `len` is too short.
#[allow(clippy::cast_ptr_alignment)] // sockaddr_storage is aligned for every sockaddr
pub(crate) fn sockaddr_to_endpoint(storage: &libc::sockaddr_storage, len: usize) -> Option<Endpoint> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            let addr = unsafe {
                &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(Endpoint::new(IpAddr::V4(ip), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            let addr = unsafe {
                &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>()
            };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(Endpoint::new(IpAddr::V6(ip), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}

/// Recover the original destination of a redirected stream connection.
///
/// Verifies the connection is a `SOCK_STREAM` socket, duplicates its
/// descriptor and runs [`RESOLVE_ORDER`] against the duplicate.
///
/// # Errors
///
/// Returns `ResolutionError` if the socket type is wrong, duplication fails,
/// or every strategy fails. Nothing is retried.
pub fn resolve_original_dst<F: AsFd>(conn: &F) -> Result<(OwnedFd, Endpoint), ResolutionError> {
    let sock = SockRef::from(conn);
    let ty = sock
        .r#type()
        .map_err(|e| ResolutionError::SocketType(e.to_string()))?;
    if ty != Type::STREAM {
        return Err(ResolutionError::NotStreamSocket(libc::c_int::from(ty)));
    }

    let dup = conn
        .as_fd()
        .try_clone_to_owned()
        .map_err(|e| ResolutionError::Duplicate(e.to_string()))?;

    let mut failures = Vec::with_capacity(RESOLVE_ORDER.len());
    for strategy in RESOLVE_ORDER {
        match strategy.query(&dup) {
            Ok(endpoint) => {
                debug!("Original destination {} via {}", endpoint, strategy);
                return Ok((dup, endpoint));
            }
            Err(e) => failures.push(format!("{strategy}: {e}")),
        }
    }

    Err(ResolutionError::OptionQueryFailed(failures.join("; ")))
}

/// A redirected TCP connection with its original destination.
///
/// The stream is backed by the duplicated descriptor used for resolution.
#[derive(Debug)]
pub struct TransparentConnection {
    stream: TcpStream,
    client: Endpoint,
    original_dst: Endpoint,
    accepted_at: Instant,
}

impl TransparentConnection {
    /// Resolve `stream`'s original destination and take over the connection.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError` if resolution fails; the connection is
    /// dropped with `stream`.
    pub fn resolve(stream: TcpStream, client: Endpoint) -> Result<Self, ResolutionError> {
        let (fd, original_dst) = resolve_original_dst(&stream)?;
        drop(stream);

        let std_stream = std::net::TcpStream::from(fd);
        std_stream
            .set_nonblocking(true)
            .map_err(|e| ResolutionError::Duplicate(e.to_string()))?;
        let stream =
            TcpStream::from_std(std_stream).map_err(|e| ResolutionError::Duplicate(e.to_string()))?;

        debug!("Transparent connection: {} -> {} (original)", client, original_dst);

        Ok(Self {
            stream,
            client,
            original_dst,
            accepted_at: Instant::now(),
        })
    }

    /// Wrap a stream whose destination is already known
    pub fn with_destination(stream: TcpStream, client: Endpoint, original_dst: Endpoint) -> Self {
        Self {
            stream,
            client,
            original_dst,
            accepted_at: Instant::now(),
        }
    }

    /// Client (source) endpoint
    #[must_use]
    pub const fn client(&self) -> Endpoint {
        self.client
    }

    /// Original destination
    #[must_use]
    pub const fn original_dst(&self) -> Endpoint {
        self.original_dst
    }

    /// Time since the connection was accepted
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.accepted_at.elapsed()
    }

    /// Local address of the underlying socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has been closed.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Consume and return the underlying stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}
