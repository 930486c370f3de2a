//! Error types for tproxy-tunnel
//!
//! Errors are grouped by the stage of the pipeline that produces them. Each
//! stage has a well-defined blast radius:
//!
//! | Error | Effect |
//! |-------|--------|
//! | [`SetupError`] | fatal, the listener never starts |
//! | [`ResolutionError`] | one intercepted stream connection is abandoned |
//! | [`DecodeError`] | one datagram is dropped |
//! | [`SessionError`] | one session is closed |
//! | [`ReplyWriteError`] | one reply datagram is lost |
//! | [`TunnelError`] | reported by tunnel implementations, surfaced as [`SessionError`] |

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tproxy-tunnel
#[derive(Debug, Error)]
pub enum TproxyTunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener or socket setup errors
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// Original destination resolution errors
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Ancillary data decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Per-session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Reply datagram errors
    #[error("Reply write error: {0}")]
    ReplyWrite(#[from] ReplyWriteError),

    /// Upstream tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TproxyTunnelError {
    /// Check if this error is recoverable (the process can keep serving)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Setup(_) => false,
            Self::Resolution(_) | Self::Decode(_) | Self::ReplyWrite(_) => true,
            Self::Session(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Listener setup errors.
///
/// Any of these aborts listener startup; there is no retry.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The configured bind address could not be parsed
    #[error("Invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Failed to create socket
    #[error("Failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option (`IP_TRANSPARENT`, etc.)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to start listening or to register with the runtime
    #[error("Failed to start listener on {addr}: {reason}")]
    Listen { addr: SocketAddr, reason: String },

    /// Permission denied (`CAP_NET_ADMIN` required)
    #[error("Permission denied: transparent sockets require CAP_NET_ADMIN capability")]
    PermissionDenied,
}

impl SetupError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Errors recovering the original destination of a stream connection
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The connection is not backed by a `SOCK_STREAM` socket
    #[error("Not a stream socket (SO_TYPE={0})")]
    NotStreamSocket(i32),

    /// `SO_TYPE` could not be queried
    #[error("Failed to query socket type: {0}")]
    SocketType(String),

    /// Duplicating the connection's descriptor failed
    #[error("Failed to duplicate descriptor: {0}")]
    Duplicate(String),

    /// Every original-destination query failed
    #[error("Original destination unavailable: {0}")]
    OptionQueryFailed(String),
}

/// Errors decoding kernel ancillary data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No original-destination record is present
    #[error("Original destination not found in control messages")]
    NotFound,

    /// A matching record is shorter than its address layout
    #[error("Original destination record truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A record header is inconsistent with the buffer
    #[error("Malformed control message: {0}")]
    Malformed(String),
}

/// Per-session errors. Every variant is terminal for its session only.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The channel selector returned no channel
    #[error("No route for {class} traffic to {host}")]
    RouteNotFound { class: String, host: String },

    /// Opening or connecting the upstream tunnel failed
    #[error("Upstream connect via {channel} to {target} failed: {reason}")]
    UpstreamConnect {
        channel: String,
        target: String,
        reason: String,
    },

    /// A read or write on the established tunnel failed
    #[error("Forwarding {direction} failed: {reason}")]
    Forward {
        direction: &'static str,
        reason: String,
    },

    /// The session was already closed
    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Session errors never affect other sessions, but only forwarding
    /// hiccups are worth retrying at the client's discretion
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Forward { .. })
    }

    /// Create a route-not-found error
    pub fn route_not_found(class: impl Into<String>, host: impl Into<String>) -> Self {
        Self::RouteNotFound {
            class: class.into(),
            host: host.into(),
        }
    }

    /// Create an upstream connect error
    pub fn upstream_connect(
        channel: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UpstreamConnect {
            channel: channel.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a forwarding error
    pub fn forward(direction: &'static str, reason: impl Into<String>) -> Self {
        Self::Forward {
            direction,
            reason: reason.into(),
        }
    }
}

/// Errors writing a reply datagram with a forged source address
#[derive(Debug, Error)]
pub enum ReplyWriteError {
    /// Local and remote endpoints belong to different address families
    #[error("Address family mismatch: reply from {remote} to {local}")]
    FamilyMismatch { local: SocketAddr, remote: SocketAddr },

    /// Creating or configuring the reply socket failed
    #[error("Failed to prepare reply socket for {remote}: {reason}")]
    Socket { remote: SocketAddr, reason: String },

    /// Binding to the original remote endpoint failed
    #[error("Failed to bind reply socket to {remote}: {reason}")]
    Bind { remote: SocketAddr, reason: String },

    /// Sending to the client failed
    #[error("Failed to send reply to {local}: {reason}")]
    Send { local: SocketAddr, reason: String },
}

impl ReplyWriteError {
    /// Create a socket preparation error
    pub fn socket(remote: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Socket {
            remote,
            reason: reason.into(),
        }
    }
}

/// Upstream tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No channel registered under this name
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Channel exists but is disabled
    #[error("Channel {0} is disabled")]
    ChannelDisabled(String),

    /// Protocol is not supported by this tunnel
    #[error("Unsupported tunnel protocol: {0}")]
    UnsupportedProtocol(String),

    /// The connect target could not be parsed
    #[error("Invalid tunnel target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Connecting to the target failed
    #[error("Failed to connect to {target}: {reason}")]
    ConnectFailed { target: String, reason: String },

    /// Connecting to the target timed out
    #[error("Connection to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    /// `connect` was called twice
    #[error("Tunnel already connected")]
    AlreadyConnected,

    /// I/O was attempted before `connect`
    #[error("Tunnel not connected")]
    NotConnected,

    /// I/O was attempted after `close`
    #[error("Tunnel closed")]
    Closed,

    /// A read deadline expired
    #[error("Read deadline exceeded")]
    DeadlineExceeded,

    /// Failed to set socket option (`SO_MARK`)
    #[error("Failed to set tunnel socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error on the tunnel
    #[error("Tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::Timeout { .. } | Self::DeadlineExceeded => true,
            Self::ChannelNotFound(_)
            | Self::ChannelDisabled(_)
            | Self::UnsupportedProtocol(_)
            | Self::InvalidTarget { .. }
            | Self::AlreadyConnected
            | Self::NotConnected
            | Self::Closed
            | Self::SocketOption { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a connect-failed error
    pub fn connect_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using [`TproxyTunnelError`]
pub type Result<T> = std::result::Result<T, TproxyTunnelError>;
