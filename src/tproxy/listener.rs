//! Transparent TCP listener
//!
//! Accepts redirected TCP connections and recovers each one's original
//! destination before handing it on.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use super::resolver::TransparentConnection;
use super::socket::SocketProvider;
use super::udp_listener::parse_listen_addr;
use crate::error::{SetupError, TproxyTunnelError};
use crate::session::{AddressFamily, Endpoint};

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 1024;

/// A transparent TCP listener
#[derive(Debug)]
pub struct TransparentTcpListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
}

impl TransparentTcpListener {
    /// Create, bind and start listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if the address is invalid, the socket cannot be
    /// configured, or bind/listen fails.
    pub fn bind(
        addr: &str,
        backlog: u32,
        provider: &dyn SocketProvider,
    ) -> Result<Self, SetupError> {
        let listen_addr = parse_listen_addr(addr)?;
        info!("Creating transparent TCP listener on {}", listen_addr);

        let socket = provider.create_tcp_socket(AddressFamily::of(&listen_addr.ip()))?;
        socket
            .bind(&listen_addr.into())
            .map_err(|e| SetupError::bind(listen_addr, e.to_string()))?;

        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(|e| SetupError::Listen {
            addr: listen_addr,
            reason: e.to_string(),
        })?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| SetupError::SocketCreation(format!("tokio registration: {e}")))?;

        let listen_addr = listener.local_addr().unwrap_or(listen_addr);
        info!(
            "Transparent TCP listener ready on {} (backlog={})",
            listen_addr, backlog
        );

        Ok(Self {
            listener,
            listen_addr,
        })
    }

    /// Accept a connection and resolve its original destination.
    ///
    /// # Errors
    ///
    /// Returns `TproxyTunnelError::Io` if accept fails and
    /// `TproxyTunnelError::Resolution` if the destination cannot be
    /// recovered. Either way the listener stays usable.
    pub async fn accept(&self) -> Result<TransparentConnection, TproxyTunnelError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("Accepted connection from {}", peer);

        Ok(TransparentConnection::resolve(stream, Endpoint::from(peer))?)
    }

    /// Bound address
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}
