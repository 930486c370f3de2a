//! Direct channel implementation
//!
//! A direct tunnel connects straight to the requested target. Outbound
//! sockets carry the configured routing mark (`SO_MARK`) so policy routing
//! can keep them out of the interception rules.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

use super::traits::{Channel, ChannelStats, UpstreamTunnel};
use crate::config::ChannelConfig;
use crate::error::TunnelError;

/// Channel that opens [`DirectTunnel`]s
pub struct DirectChannel {
    name: String,
    connect_timeout: Duration,
    routing_mark: Option<u32>,
    enabled: AtomicBool,
    stats: Arc<ChannelStats>,
}

impl DirectChannel {
    /// Create a direct channel
    pub fn new(name: impl Into<String>, connect_timeout: Duration, routing_mark: Option<u32>) -> Self {
        Self {
            name: name.into(),
            connect_timeout,
            routing_mark,
            enabled: AtomicBool::new(true),
            stats: Arc::new(ChannelStats::default()),
        }
    }

    /// Create a direct channel from configuration
    #[must_use]
    pub fn from_config(config: &ChannelConfig, routing_mark: Option<u32>) -> Self {
        let channel = Self::new(config.name.clone(), config.connect_timeout(), routing_mark);
        channel.set_enabled(config.enabled);
        channel
    }
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("name", &self.name)
            .field("connect_timeout", &self.connect_timeout)
            .field("routing_mark", &self.routing_mark)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Channel for DirectChannel {
    async fn open(&self) -> Result<Arc<dyn UpstreamTunnel>, TunnelError> {
        if !self.is_enabled() {
            return Err(TunnelError::ChannelDisabled(self.name.clone()));
        }
        Ok(Arc::new(DirectTunnel::new(
            self.name.clone(),
            self.connect_timeout,
            self.routing_mark,
            Arc::clone(&self.stats),
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> &'static str {
        "direct"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }
}

enum Connection {
    Datagram(UdpSocket),
    Stream {
        reader: Mutex<OwnedReadHalf>,
        writer: Mutex<OwnedWriteHalf>,
    },
}

/// A tunnel that is a plain socket to the target
pub struct DirectTunnel {
    channel: String,
    connect_timeout: Duration,
    routing_mark: Option<u32>,
    stats: Arc<ChannelStats>,
    conn: OnceCell<Connection>,
    read_deadline: parking_lot::Mutex<Option<Instant>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl DirectTunnel {
    fn new(
        channel: String,
        connect_timeout: Duration,
        routing_mark: Option<u32>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            channel,
            connect_timeout,
            routing_mark,
            stats,
            conn: OnceCell::new(),
            read_deadline: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn create_socket(&self, addr: SocketAddr, ty: Type, protocol: Protocol) -> Result<Socket, TunnelError> {
        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))
            .map_err(|e| TunnelError::connect_failed(addr.to_string(), e.to_string()))?;

        if let Some(mark) = self.routing_mark {
            set_routing_mark(&socket, mark)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| TunnelError::socket_option("O_NONBLOCK", e.to_string()))?;

        Ok(socket)
    }

    async fn connect_datagram(&self, addr: SocketAddr) -> Result<Connection, TunnelError> {
        let socket = self.create_socket(addr, Type::DGRAM, Protocol::UDP)?;
        let any: SocketAddr = match addr {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket
            .bind(&any.into())
            .map_err(|e| TunnelError::connect_failed(addr.to_string(), e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        match timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(())) => Ok(Connection::Datagram(socket)),
            Ok(Err(e)) => Err(TunnelError::connect_failed(addr.to_string(), e.to_string())),
            Err(_) => Err(self.timeout_error(addr)),
        }
    }

    async fn connect_stream(&self, addr: SocketAddr) -> Result<Connection, TunnelError> {
        let socket = self.create_socket(addr, Type::STREAM, Protocol::TCP)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(TunnelError::connect_failed(addr.to_string(), e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        let connected = timeout(self.connect_timeout, async {
            stream.writable().await?;
            match stream.take_error()? {
                Some(e) => Err(e),
                None => Ok::<(), io::Error>(()),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!("Failed to set TCP_NODELAY: {}", e);
                }
                let (reader, writer) = stream.into_split();
                Ok(Connection::Stream {
                    reader: Mutex::new(reader),
                    writer: Mutex::new(writer),
                })
            }
            Ok(Err(e)) => Err(TunnelError::connect_failed(addr.to_string(), e.to_string())),
            Err(_) => Err(self.timeout_error(addr)),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn timeout_error(&self, addr: SocketAddr) -> TunnelError {
        TunnelError::Timeout {
            target: addr.to_string(),
            timeout_ms: self.connect_timeout.as_millis() as u64,
        }
    }

    fn connection(&self) -> Result<&Connection, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        self.conn.get().ok_or(TunnelError::NotConnected)
    }
}

/// Resolve a `host:port` target. IP literals skip the resolver.
async fn resolve_target(target: &str) -> Result<SocketAddr, TunnelError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(target)
        .await
        .map_err(|e| TunnelError::InvalidTarget {
            target: target.into(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TunnelError::InvalidTarget {
            target: target.into(),
            reason: "no addresses".into(),
        })
}

#[async_trait]
impl UpstreamTunnel for DirectTunnel {
    async fn connect(&self, protocol: &str, target: &str) -> Result<(), TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        if self.conn.initialized() {
            return Err(TunnelError::AlreadyConnected);
        }

        let stream = match protocol {
            "udp" => false,
            "tcp" => true,
            other => return Err(TunnelError::UnsupportedProtocol(other.into())),
        };

        let addr = resolve_target(target).await?;
        let result = if stream {
            self.connect_stream(addr).await
        } else {
            self.connect_datagram(addr).await
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        self.conn
            .set(conn)
            .map_err(|_| TunnelError::AlreadyConnected)?;
        self.stats.record_open();
        debug!("Direct {} tunnel to {} via {}", protocol, addr, self.channel);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        match self.connection()? {
            Connection::Datagram(socket) => Ok(socket.send(data).await?),
            Connection::Stream { writer, .. } => {
                writer.lock().await.write_all(data).await?;
                Ok(data.len())
            }
        }
    }

    async fn shutdown_write(&self) -> Result<(), TunnelError> {
        match self.connection()? {
            Connection::Datagram(_) => Ok(()),
            Connection::Stream { writer, .. } => {
                writer.lock().await.shutdown().await?;
                Ok(())
            }
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let conn = self.connection()?;
        let deadline = *self.read_deadline.lock();

        let read = async {
            match conn {
                Connection::Datagram(socket) => socket.recv(buf).await,
                Connection::Stream { reader, .. } => reader.lock().await.read(buf).await,
            }
        };
        let bounded = async {
            match deadline {
                Some(deadline) => match timeout_at(deadline, read).await {
                    Ok(result) => result.map_err(TunnelError::from),
                    Err(_) => Err(TunnelError::DeadlineExceeded),
                },
                None => read.await.map_err(TunnelError::from),
            }
        };

        tokio::select! {
            biased;
            () = notified => Err(TunnelError::Closed),
            result = bounded => result,
        }
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self.read_deadline.lock() = Some(deadline);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_notify.notify_waiters();

        if let Some(Connection::Stream { writer, .. }) = self.conn.get() {
            if let Ok(mut writer) = writer.try_lock() {
                let _ = writer.shutdown().await;
            }
        }
        debug!("Direct tunnel via {} closed", self.channel);
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

/// Set `SO_MARK` for policy routing
///
/// # Errors
///
/// Returns `TunnelError::SocketOption` if setsockopt fails (usually missing
/// `CAP_NET_ADMIN`).
#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
pub fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), TunnelError> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(TunnelError::socket_option(
            "SO_MARK",
            format!("Failed to set routing mark {mark}: {err}"),
        ));
    }

    debug!("Set routing mark: {}", mark);
    Ok(())
}
