//! Upstream tunnel trait definitions
//!
//! The proxy core only talks to upstream transports through these traits:
//!
//! - [`UpstreamTunnel`]: one connected upstream stream or datagram flow
//! - [`Channel`]: a named source of tunnels (a configured upstream)
//! - [`TunnelProvider`]: opens a tunnel on a channel by name
//! - [`ChannelSelector`]: picks the channel for a destination

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::TunnelError;

/// Traffic class used for routing and session behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolClass {
    /// DNS over UDP (destination port 53): short timeout, single reply
    Dns,
    /// Any other UDP flow: long timeout, continuous relaying
    Udp,
    /// Redirected TCP stream
    Tcp,
}

impl ProtocolClass {
    /// Destination port that marks a UDP flow as DNS
    pub const DNS_PORT: u16 = 53;

    /// Classify a UDP flow by its destination port
    #[must_use]
    pub const fn classify_udp(port: u16) -> Self {
        if port == Self::DNS_PORT {
            Self::Dns
        } else {
            Self::Udp
        }
    }

    /// Name used in routing rules and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    /// Transport protocol requested from the tunnel on connect
    #[must_use]
    pub const fn transport(self) -> &'static str {
        match self {
            Self::Dns | Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    /// Whether one upstream reply completes the flow
    #[must_use]
    pub const fn is_single_shot(self) -> bool {
        matches!(self, Self::Dns)
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel to an upstream carrying one flow.
///
/// All operations take `&self`: a session writes from its driver task and
/// reads from its reader task concurrently through one `Arc`.
#[async_trait]
pub trait UpstreamTunnel: Send + Sync {
    /// Ask the upstream to connect to `target` (`host:port`) using
    /// `protocol` (`"udp"` or `"tcp"`).
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the connect request fails.
    async fn connect(&self, protocol: &str, target: &str) -> Result<(), TunnelError>;

    /// Write one message. For datagram tunnels one call is one datagram.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the write fails.
    async fn write(&self, data: &[u8]) -> Result<usize, TunnelError>;

    /// Read the next chunk. `Ok(0)` means the upstream finished.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::DeadlineExceeded` once the read deadline
    /// passes, or any other `TunnelError` on failure.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Half-close the write side: the upstream sees end of stream while
    /// reads keep working. Datagram tunnels have nothing to half-close.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the shutdown fails.
    async fn shutdown_write(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    /// Set the deadline for pending and future reads
    fn set_read_deadline(&self, deadline: Instant);

    /// Close the tunnel. Idempotent; wakes blocked reads.
    async fn close(&self);

    /// Name of the channel this tunnel was opened on
    fn channel(&self) -> &str;
}

/// Counters for a channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Tunnels opened successfully
    pub opened: AtomicU64,
    /// Tunnels that failed to open or connect
    pub failed: AtomicU64,
}

impl ChannelStats {
    /// Record a successful open
    pub fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the stats
    #[must_use]
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of channel stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub opened: u64,
    pub failed: u64,
}

/// A named upstream that can open tunnels
#[async_trait]
pub trait Channel: Send + Sync {
    /// Open a new, unconnected tunnel
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the channel cannot open tunnels.
    async fn open(&self) -> Result<Arc<dyn UpstreamTunnel>, TunnelError>;

    /// Unique channel name
    fn name(&self) -> &str;

    /// Implementation type (e.g. `"direct"`)
    fn channel_type(&self) -> &'static str;

    /// Whether the channel accepts new tunnels
    fn is_enabled(&self) -> bool;

    /// Enable or disable the channel
    fn set_enabled(&self, enabled: bool);

    /// Channel counters
    fn stats(&self) -> Arc<ChannelStats>;
}

/// Opens tunnels on channels by name
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel on `channel`
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::ChannelNotFound` for unknown channels, or the
    /// channel's own error.
    async fn open_tunnel(&self, channel: &str) -> Result<Arc<dyn UpstreamTunnel>, TunnelError>;
}

/// Picks the channel that serves a destination
pub trait ChannelSelector: Send + Sync {
    /// Select a channel for traffic of `class` going to `host`.
    ///
    /// `None` means there is no route.
    fn select_channel(&self, class: ProtocolClass, host: &str) -> Option<String>;
}
