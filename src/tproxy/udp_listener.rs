//! Transparent UDP listener
//!
//! UDP has no per-flow socket. A single transparent socket with
//! `IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR` receives every redirected
//! datagram, and the kernel attaches the original destination to each one as
//! a control message. The listener decodes it and hands the datagram to the
//! session for `(client, original destination)`.
//!
//! # Required iptables
//!
//! ```bash
//! iptables -t mangle -A PREROUTING -i wg-ingress -p udp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! ```

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::cmsg::decode_original_dst;
use super::resolver::sockaddr_to_endpoint;
use super::socket::SocketProvider;
use crate::error::{DecodeError, SetupError, TproxyTunnelError};
use crate::session::{
    dispatch_datagram, AddressFamily, EnqueueResult, Endpoint, SessionContext, SessionKey,
    UdpSessionTable,
};

/// Default receive buffer size (largest UDP payload)
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Control message buffer size (fits one `sockaddr_in6` record)
const CMSG_BUFFER_SIZE: usize = 64;

/// Parse a `host:port` listen address.
///
/// The host must be an IP literal, IPv6 optionally in brackets. An empty host
/// means the IPv4 wildcard.
///
/// # Errors
///
/// Returns `SetupError::InvalidAddress` if the port is missing or invalid, or
/// if the host is not an IP literal.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, SetupError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| SetupError::invalid_address(addr, "missing port"))?;

    let port: u16 = port
        .parse()
        .map_err(|e| SetupError::invalid_address(addr, format!("invalid port: {e}")))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>().map_err(|_| {
            SetupError::invalid_address(addr, format!("host {host:?} is not an IP literal"))
        })?
    };

    Ok(SocketAddr::new(ip, port))
}

/// A received datagram with its flow endpoints
#[derive(Debug, Clone)]
pub struct UdpPacketInfo {
    /// Payload
    pub data: Bytes,
    /// Client (source) endpoint
    pub client: Endpoint,
    /// Original destination from the control message
    pub original_dst: Endpoint,
    /// Receive time
    pub received_at: Instant,
}

impl UdpPacketInfo {
    /// Payload size
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Session key for this datagram
    #[must_use]
    pub const fn session_key(&self) -> SessionKey {
        SessionKey::new(self.client, self.original_dst)
    }
}

/// UDP listener counters
#[derive(Debug, Default)]
pub struct UdpListenerStats {
    /// Datagrams received
    pub packets_received: AtomicU64,
    /// Payload bytes received
    pub bytes_received: AtomicU64,
    /// `recvmsg` failures
    pub recv_errors: AtomicU64,
    /// Datagrams without a usable original destination
    pub decode_errors: AtomicU64,
    /// Datagrams dropped at a session (queue full or closing)
    pub dropped: AtomicU64,
}

impl UdpListenerStats {
    /// Get a snapshot of the stats
    #[must_use]
    pub fn snapshot(&self) -> UdpListenerStatsSnapshot {
        UdpListenerStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of UDP listener stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UdpListenerStatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub recv_errors: u64,
    pub decode_errors: u64,
    pub dropped: u64,
}

/// Transparent UDP listener
#[derive(Debug)]
pub struct TransparentUdpListener {
    socket: UdpSocket,
    listen_addr: SocketAddr,
    recv_buffer_size: usize,
    stats: UdpListenerStats,
}

impl TransparentUdpListener {
    /// Create and bind a listener on `addr`.
    ///
    /// The family follows the host literal. The socket gets `SO_REUSEADDR`,
    /// transparent mode and original-destination delivery before binding.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if the address is invalid or any socket step
    /// fails. The listener cannot run without every option, so callers treat
    /// this as fatal.
    pub fn bind(addr: &str, provider: &dyn SocketProvider) -> Result<Self, SetupError> {
        let listen_addr = parse_listen_addr(addr)?;
        let family = AddressFamily::of(&listen_addr.ip());

        info!("Creating transparent UDP listener on {}", listen_addr);

        let socket = provider.create_udp_socket(family)?;
        socket
            .bind(&listen_addr.into())
            .map_err(|e| SetupError::bind(listen_addr, e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| SetupError::SocketCreation(format!("tokio registration: {e}")))?;

        let listen_addr = socket.local_addr().unwrap_or(listen_addr);
        info!("Transparent UDP listener ready on {}", listen_addr);

        Ok(Self {
            socket,
            listen_addr,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            stats: UdpListenerStats::default(),
        })
    }

    /// Set the receive buffer size used by [`run`](Self::run)
    #[must_use]
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    /// Bound address
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Listener stats
    #[must_use]
    pub const fn stats(&self) -> &UdpListenerStats {
        &self.stats
    }

    /// Receive one datagram and decode its original destination.
    ///
    /// # Errors
    ///
    /// Returns `TproxyTunnelError::Io` if `recvmsg` fails and
    /// `TproxyTunnelError::Decode` if the control data or source address is
    /// unusable.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<UdpPacketInfo, TproxyTunnelError> {
        let mut control = [0u8; CMSG_BUFFER_SIZE];
        let fd = self.socket.as_raw_fd();

        let received = self
            .socket
            .async_io(Interest::READABLE, || recv_msg(fd, buf, &mut control))
            .await;

        let received = match received {
            Ok(received) => received,
            Err(e) => {
                self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let decoded = decode_received(&received, &control);
        let (client, original_dst) = match decoded {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(received.len as u64, Ordering::Relaxed);

        trace!(
            "UDP packet: {} -> {} ({} bytes)",
            client,
            original_dst,
            received.len
        );

        Ok(UdpPacketInfo {
            data: Bytes::copy_from_slice(&buf[..received.len]),
            client,
            original_dst,
            received_at: Instant::now(),
        })
    }

    /// Receive loop: dispatch every datagram to its session until `shutdown`
    /// fires.
    ///
    /// Receive and decode errors are logged and the loop continues.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        table: Arc<UdpSessionTable>,
        ctx: SessionContext,
    ) {
        let mut buf = vec![0u8; self.recv_buffer_size];
        info!("UDP listener on {} accepting datagrams", self.listen_addr);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("UDP listener on {} shutting down", self.listen_addr);
                    break;
                }

                result = self.recv(&mut buf) => match result {
                    Ok(packet) => self.dispatch(&table, &ctx, packet),
                    Err(e) => warn!("UDP receive error on {}: {}", self.listen_addr, e),
                },
            }
        }
    }

    fn dispatch(&self, table: &Arc<UdpSessionTable>, ctx: &SessionContext, packet: UdpPacketInfo) {
        let key = packet.session_key();
        match dispatch_datagram(table, ctx, key, packet.data) {
            EnqueueResult::Queued => {}
            EnqueueResult::Full => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("UDP session {} queue full, datagram dropped", key);
            }
            EnqueueResult::Closed => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("UDP session {} closing, datagram dropped", key);
            }
        }
    }
}

/// Raw result of one `recvmsg` call
#[derive(Debug)]
struct Received {
    len: usize,
    source: Option<Endpoint>,
    control_len: usize,
    flags: libc::c_int,
}

fn decode_received(
    received: &Received,
    control: &[u8],
) -> Result<(Endpoint, Endpoint), DecodeError> {
    if received.flags & libc::MSG_CTRUNC != 0 {
        return Err(DecodeError::Malformed(
            "control data truncated (MSG_CTRUNC)".into(),
        ));
    }

    let client = received
        .source
        .ok_or_else(|| DecodeError::Malformed("unsupported source address".into()))?;

    let control = &control[..received.control_len.min(control.len())];
    let original_dst = decode_original_dst(control)?;
    Ok((client, original_dst))
}

/// One non-blocking `recvmsg` into `buf`, with source address and control
/// data.
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::cast_sign_loss)] // n is non-negative after the error check
fn recv_msg(fd: RawFd, buf: &mut [u8], control: &mut [u8]) -> io::Result<Received> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut source: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(source).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, std::ptr::addr_of_mut!(msg), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(Received {
        len: n as usize,
        source: sockaddr_to_endpoint(&source, msg.msg_namelen as usize),
        control_len: msg.msg_controllen,
        flags: msg.msg_flags,
    })
}
