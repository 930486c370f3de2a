//! Transparent socket utilities
//!
//! This module provides the low-level socket operations for transparent
//! proxying. Key capabilities:
//! - `IP_TRANSPARENT` / `IPV6_TRANSPARENT`: bind to non-local addresses and
//!   receive TPROXY-redirected traffic
//! - `IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR`: receive the original
//!   destination of each datagram as a control message
//! - `SO_ORIGINAL_DST` / `IP6T_SO_ORIGINAL_DST`: query the original
//!   destination of a redirected stream connection
//!
//! # Socket Provider Trait
//!
//! Socket creation goes through the [`SocketProvider`] trait. Production code
//! uses [`TransparentSocketProvider`]; [`UnprivilegedSocketProvider`] builds
//! the same sockets without transparent mode so the pipeline can be exercised
//! on loopback without `CAP_NET_ADMIN`.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::{ReplyWriteError, SetupError};
use crate::session::AddressFamily;

/// `IP_TRANSPARENT` (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// `IPV6_TRANSPARENT` (`SOL_IPV6` level)
pub const IPV6_TRANSPARENT: libc::c_int = 75;

/// `IP_RECVORIGDSTADDR` (`SOL_IP` level)
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// `IPV6_RECVORIGDSTADDR` (`SOL_IPV6` level)
pub const IPV6_RECVORIGDSTADDR: libc::c_int = 74;

/// `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// `IP6T_SO_ORIGINAL_DST` (`SOL_IPV6` level)
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// socket2 domain for an address family
#[must_use]
pub const fn domain(family: AddressFamily) -> Domain {
    match family {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    }
}

// =============================================================================
// Socket Provider Trait
// =============================================================================

/// Abstracts socket creation for the listeners and the reply writer.
pub trait SocketProvider: Send + Sync {
    /// Create an unbound intercepting UDP socket of the given family.
    ///
    /// The returned socket has `SO_REUSEADDR`, transparent mode (if the
    /// provider supports it), receive-original-destination and non-blocking
    /// mode enabled.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if socket creation or option setting fails.
    fn create_udp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError>;

    /// Create an unbound intercepting TCP socket of the given family.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if socket creation or option setting fails.
    fn create_tcp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError>;

    /// Create a reply socket bound to `remote`, the original destination.
    ///
    /// # Errors
    ///
    /// Returns `ReplyWriteError` if creation, option setting or binding fails.
    fn create_reply_socket(&self, remote: SocketAddr) -> Result<Socket, ReplyWriteError>;
}

/// Production provider: sockets are created in transparent mode.
///
/// Requires `CAP_NET_ADMIN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransparentSocketProvider;

impl TransparentSocketProvider {
    /// Create a new transparent socket provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for TransparentSocketProvider {
    fn create_udp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError> {
        create_udp_socket(family, true)
    }

    fn create_tcp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError> {
        create_tcp_socket(family, true)
    }

    fn create_reply_socket(&self, remote: SocketAddr) -> Result<Socket, ReplyWriteError> {
        create_reply_socket(remote, true)
    }
}

/// Provider that skips transparent mode.
///
/// Datagrams still carry original-destination control messages (for
/// non-redirected traffic the kernel reports the socket's own address), and
/// reply sockets can bind to any local address.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnprivilegedSocketProvider;

impl UnprivilegedSocketProvider {
    /// Create a new unprivileged socket provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SocketProvider for UnprivilegedSocketProvider {
    fn create_udp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError> {
        create_udp_socket(family, false)
    }

    fn create_tcp_socket(&self, family: AddressFamily) -> Result<Socket, SetupError> {
        create_tcp_socket(family, false)
    }

    fn create_reply_socket(&self, remote: SocketAddr) -> Result<Socket, ReplyWriteError> {
        create_reply_socket(remote, false)
    }
}

/// Get the default socket provider (production implementation).
#[must_use]
pub fn default_socket_provider() -> Arc<dyn SocketProvider> {
    Arc::new(TransparentSocketProvider::new())
}

// =============================================================================
// Socket Creation Functions
// =============================================================================

fn create_udp_socket(family: AddressFamily, transparent: bool) -> Result<Socket, SetupError> {
    let socket = Socket::new(domain(family), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| SetupError::SocketCreation(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| SetupError::socket_option("SO_REUSEADDR", e.to_string()))?;

    if transparent {
        set_transparent(&socket, family)?;
    }

    set_recv_orig_dst(&socket, family)?;

    socket
        .set_nonblocking(true)
        .map_err(|e| SetupError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!(
        "Created {} UDP socket (transparent={})",
        family, transparent
    );
    Ok(socket)
}

fn create_tcp_socket(family: AddressFamily, transparent: bool) -> Result<Socket, SetupError> {
    let socket = Socket::new(domain(family), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| SetupError::SocketCreation(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| SetupError::socket_option("SO_REUSEADDR", e.to_string()))?;

    if transparent {
        set_transparent(&socket, family)?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| SetupError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!(
        "Created {} TCP socket (transparent={})",
        family, transparent
    );
    Ok(socket)
}

fn create_reply_socket(remote: SocketAddr, transparent: bool) -> Result<Socket, ReplyWriteError> {
    let family = AddressFamily::of(&remote.ip());

    let socket = Socket::new(domain(family), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ReplyWriteError::socket(remote, format!("create: {e}")))?;

    if transparent {
        set_transparent(&socket, family)
            .map_err(|e| ReplyWriteError::socket(remote, e.to_string()))?;
    }

    socket
        .set_reuse_address(true)
        .map_err(|e| ReplyWriteError::socket(remote, format!("SO_REUSEADDR: {e}")))?;

    socket.bind(&remote.into()).map_err(|e| ReplyWriteError::Bind {
        remote,
        reason: e.to_string(),
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| ReplyWriteError::socket(remote, format!("O_NONBLOCK: {e}")))?;

    Ok(socket)
}

/// Set an integer socket option to 1.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
fn enable_option(socket: &Socket, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Enable transparent mode for the socket's family.
///
/// # Errors
///
/// Returns `SetupError::PermissionDenied` if `CAP_NET_ADMIN` is missing,
/// `SetupError::SocketOption` for any other failure.
pub fn set_transparent(socket: &Socket, family: AddressFamily) -> Result<(), SetupError> {
    let (level, name, option) = match family {
        AddressFamily::Ipv4 => (libc::SOL_IP, IP_TRANSPARENT, "IP_TRANSPARENT"),
        AddressFamily::Ipv6 => (libc::SOL_IPV6, IPV6_TRANSPARENT, "IPV6_TRANSPARENT"),
    };

    enable_option(socket, level, name).map_err(|err| {
        if err.raw_os_error() == Some(libc::EPERM) {
            SetupError::PermissionDenied
        } else {
            SetupError::socket_option(option, err.to_string())
        }
    })
}

/// Enable delivery of the original destination as a control message.
///
/// # Errors
///
/// Returns `SetupError::SocketOption` if setsockopt fails.
pub fn set_recv_orig_dst(socket: &Socket, family: AddressFamily) -> Result<(), SetupError> {
    let (level, name, option) = match family {
        AddressFamily::Ipv4 => (libc::SOL_IP, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR"),
        AddressFamily::Ipv6 => (libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, "IPV6_RECVORIGDSTADDR"),
    };

    enable_option(socket, level, name)
        .map_err(|err| SetupError::socket_option(option, err.to_string()))
}

/// Check if the current process has `CAP_NET_ADMIN` capability.
///
/// Probes by creating a transparent TCP socket.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(
        create_tcp_socket(AddressFamily::Ipv4, true),
        Err(SetupError::PermissionDenied)
    )
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(IP_TRANSPARENT, 19);
        assert_eq!(IPV6_TRANSPARENT, 75);
        assert_eq!(IP_RECVORIGDSTADDR, 20);
        assert_eq!(IPV6_RECVORIGDSTADDR, 74);
        assert_eq!(SO_ORIGINAL_DST, 80);
        assert_eq!(IP6T_SO_ORIGINAL_DST, 80);
    }

    #[test]
    fn test_transparent_socket_without_cap() {
        // Either we have CAP_NET_ADMIN or we get a clean PermissionDenied
        match TransparentSocketProvider::new().create_udp_socket(AddressFamily::Ipv4) {
            Ok(_) | Err(SetupError::PermissionDenied) => {}
            Err(e) => panic!("Unexpected error: {e}"),
        }
    }

    #[test]
    fn test_unprivileged_udp_socket() {
        let provider = UnprivilegedSocketProvider::new();
        let socket = provider.create_udp_socket(AddressFamily::Ipv4).unwrap();
        assert!(socket.reuse_address().unwrap());
        assert_eq!(socket.r#type().unwrap(), Type::DGRAM);
    }

    #[test]
    fn test_unprivileged_tcp_socket() {
        let provider = UnprivilegedSocketProvider::new();
        let socket = provider.create_tcp_socket(AddressFamily::Ipv4).unwrap();
        assert_eq!(socket.r#type().unwrap(), Type::STREAM);
    }

    #[test]
    fn test_unprivileged_reply_socket_binds_remote() {
        let provider = UnprivilegedSocketProvider::new();
        let remote: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = provider.create_reply_socket(remote).unwrap();
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        assert_eq!(local.ip(), remote.ip());
    }

    #[test]
    fn test_reply_socket_non_local_bind_fails_without_transparent() {
        let provider = UnprivilegedSocketProvider::new();
        let remote: SocketAddr = "203.0.113.5:53".parse().unwrap();
        // Succeeds only when ip_nonlocal_bind is set on this host
        if let Err(e) = provider.create_reply_socket(remote) {
            assert!(matches!(e, ReplyWriteError::Bind { .. }));
        }
    }

    #[test]
    fn test_socket_provider_trait_object() {
        let provider: Arc<dyn SocketProvider> = Arc::new(UnprivilegedSocketProvider::new());
        assert!(provider.create_udp_socket(AddressFamily::Ipv4).is_ok());
    }

    #[test]
    fn test_is_root() {
        let _ = is_root();
    }
}
