//! UDP reply writer
//!
//! Replies to intercepted datagrams must look like they come from the
//! destination the client originally dialed. Each reply is sent from a
//! fresh transparent socket bound to that destination:
//!
//! ```text
//! upstream reply -> ReplyWriter -> transparent socket -> client
//!                                  bound to original dst
//!                                  sendto(client)
//! ```
//!
//! The socket lives only for one send. Binding to a non-local address needs
//! `CAP_NET_ADMIN` (for `IP_TRANSPARENT`) or `net.ipv4.ip_nonlocal_bind = 1`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::trace;

use super::socket::SocketProvider;
use crate::error::ReplyWriteError;
use crate::session::Endpoint;

/// Sends one reply datagram from `remote` to `local`
#[async_trait]
pub trait ReplyWriter: Send + Sync {
    /// Send `data` to `local` (the client) with source address `remote`
    /// (the original destination).
    ///
    /// # Errors
    ///
    /// Returns `ReplyWriteError` on any failure. Callers drop the reply.
    async fn send_reply(
        &self,
        data: &[u8],
        local: Endpoint,
        remote: Endpoint,
    ) -> Result<usize, ReplyWriteError>;
}

/// Statistics for the reply writer
#[derive(Debug, Default)]
pub struct ReplyWriterStats {
    /// Total replies sent
    pub replies_sent: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Replies that failed at socket setup, bind or send
    pub failures: AtomicU64,
}

impl ReplyWriterStats {
    /// Get a snapshot of the stats
    #[must_use]
    pub fn snapshot(&self) -> ReplyWriterStatsSnapshot {
        ReplyWriterStatsSnapshot {
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reply writer stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplyWriterStatsSnapshot {
    pub replies_sent: u64,
    pub bytes_sent: u64,
    pub failures: u64,
}

/// Production reply writer: one ephemeral socket per reply
pub struct TransparentReplyWriter {
    provider: Arc<dyn SocketProvider>,
    stats: ReplyWriterStats,
}

impl TransparentReplyWriter {
    /// Create a reply writer that builds sockets with `provider`
    #[must_use]
    pub fn new(provider: Arc<dyn SocketProvider>) -> Self {
        Self {
            provider,
            stats: ReplyWriterStats::default(),
        }
    }

    /// Reply writer stats
    #[must_use]
    pub const fn stats(&self) -> &ReplyWriterStats {
        &self.stats
    }

    async fn send_once(
        &self,
        data: &[u8],
        local: Endpoint,
        remote: Endpoint,
    ) -> Result<usize, ReplyWriteError> {
        if local.family() != remote.family() {
            return Err(ReplyWriteError::FamilyMismatch {
                local: local.into(),
                remote: remote.into(),
            });
        }

        let socket = self.provider.create_reply_socket(remote.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| ReplyWriteError::socket(remote.into(), e.to_string()))?;

        socket
            .send_to(data, SocketAddr::from(local))
            .await
            .map_err(|e| ReplyWriteError::Send {
                local: local.into(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for TransparentReplyWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransparentReplyWriter")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReplyWriter for TransparentReplyWriter {
    async fn send_reply(
        &self,
        data: &[u8],
        local: Endpoint,
        remote: Endpoint,
    ) -> Result<usize, ReplyWriteError> {
        match self.send_once(data, local, remote).await {
            Ok(n) => {
                self.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                trace!("Reply {} -> {} ({} bytes)", remote, local, n);
                Ok(n)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
