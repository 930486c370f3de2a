//! tproxy-tunnel: transparent proxy core forwarding into upstream tunnels
//!
//! Intercepts traffic redirected by Linux TPROXY, recovers the destination
//! each client originally dialed, and forwards the payload through an
//! upstream tunnel. UDP replies are sent back with a forged source so they
//! appear to come from the real destination.
//!
//! # Architecture
//!
//! ```text
//! Client → iptables TPROXY → TransparentUdpListener ──recvmsg + cmsg──┐
//!                                                                    ▼
//!                                   SessionTable ── get-or-create ── UdpSession
//!                                                                    │
//!                                   ChannelSelector → TunnelProvider → UpstreamTunnel
//!                                                                    │
//! Client ◄── forged source ── ReplyWriter ◄────── reader task ◄───────┘
//!
//! Client → iptables TPROXY → TransparentTcpListener → SO_ORIGINAL_DST → relay
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tproxy_tunnel::config::load_config;
//! use tproxy_tunnel::session::{SessionConfig, SessionContext, UdpSessionTable};
//! use tproxy_tunnel::tproxy::{default_socket_provider, TransparentReplyWriter, TransparentUdpListener};
//! use tproxy_tunnel::tunnel::{ChannelManager, RuleChannelSelector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tproxy-tunnel/config.json")?;
//! let provider = default_socket_provider();
//!
//! let ctx = SessionContext {
//!     selector: Arc::new(RuleChannelSelector::from_config(&config)),
//!     tunnels: Arc::new(ChannelManager::from_config(&config)),
//!     replies: Arc::new(TransparentReplyWriter::new(Arc::clone(&provider))),
//!     config: SessionConfig::from(&config.udp),
//! };
//!
//! let listener = TransparentUdpListener::bind("127.0.0.1:7893", provider.as_ref())?;
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! listener.run(shutdown_rx, Arc::new(UdpSessionTable::new()), ctx).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: TCP accept loop, relay and statistics
//! - [`error`]: Error types
//! - [`session`]: Flow identity, session table, UDP session state machine
//! - [`tproxy`]: TPROXY sockets, destination recovery, listeners, reply writer
//! - [`tunnel`]: Upstream tunnel traits, channels and routing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod tproxy;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, ListenConfig, UdpConfig};
pub use error::{
    ConfigError, DecodeError, ReplyWriteError, ResolutionError, SessionError, SetupError,
    TproxyTunnelError, TunnelError,
};
pub use session::{Endpoint, SessionKey, SessionTable, UdpSession, UdpSessionTable};
pub use tproxy::{TransparentTcpListener, TransparentUdpListener};
pub use tunnel::{ChannelSelector, TunnelProvider, UpstreamTunnel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with required capabilities for TPROXY
///
/// # Errors
///
/// Returns `SetupError::PermissionDenied` without `CAP_NET_ADMIN`.
pub fn check_capabilities() -> Result<(), SetupError> {
    if !tproxy::has_net_admin_capability() {
        return Err(SetupError::PermissionDenied);
    }
    Ok(())
}
