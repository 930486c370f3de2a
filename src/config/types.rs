//! Configuration types for tproxy-tunnel
//!
//! Configuration is loaded from JSON files and validated at startup.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tproxy::parse_listen_addr;
use crate::tunnel::{HostMatcher, ProtocolClass};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listener addresses
    #[serde(default)]
    pub listen: ListenConfig,

    /// UDP session behaviour
    #[serde(default)]
    pub udp: UdpConfig,

    /// Upstream channels
    pub channels: Vec<ChannelConfig>,

    /// Routing rules, first match wins
    #[serde(default)]
    pub rules: Vec<RouteRule>,

    /// Channel used when no rule matches. `None` means unmatched traffic
    /// has no route.
    #[serde(default)]
    pub default_channel: Option<String>,

    /// `SO_MARK` applied to every outbound socket so redirected traffic
    /// does not loop back into the proxy
    #[serde(default)]
    pub socket_mark: Option<u32>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.udp.validate()?;

        if self.channels.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one channel must be configured".into(),
            ));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !names.insert(&channel.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate channel name: {}",
                    channel.name
                )));
            }
        }

        if let Some(ref default) = self.default_channel {
            if !names.contains(default.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Default channel '{default}' not found in channels list"
                )));
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate(i, &names)?;
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            listen: ListenConfig::default(),
            udp: UdpConfig::default(),
            channels: vec![ChannelConfig::direct("direct")],
            rules: Vec::new(),
            default_channel: Some("direct".into()),
            socket_mark: Some(default_socket_mark()),
            log: LogConfig::default(),
        }
    }
}

/// Listener configuration.
///
/// Addresses are `host:port`; an empty host (`":7893"`) binds the IPv4
/// wildcard and an IPv6 literal must be bracketed (`"[::]:7893"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// UDP listener address, `None` disables UDP interception
    #[serde(default = "default_listen_addr")]
    pub udp: Option<String>,

    /// TCP listener address, `None` disables TCP interception
    #[serde(default = "default_listen_addr")]
    pub tcp: Option<String>,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub tcp_backlog: u32,
}

impl ListenConfig {
    /// Validate listen configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udp.is_none() && self.tcp.is_none() {
            return Err(ConfigError::ValidationError(
                "At least one of listen.udp or listen.tcp must be set".into(),
            ));
        }

        for addr in self.udp.iter().chain(self.tcp.iter()) {
            parse_listen_addr(addr).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        if self.tcp_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_backlog must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            udp: default_listen_addr(),
            tcp: default_listen_addr(),
            tcp_backlog: default_backlog(),
        }
    }
}

/// UDP session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Upstream read timeout for generic UDP sessions
    #[serde(default = "default_udp_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Upstream read timeout for DNS sessions
    #[serde(default = "default_dns_read_timeout_ms")]
    pub dns_read_timeout_ms: u64,

    /// Datagrams buffered per session while its tunnel is being set up
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Receive buffer for intercepted datagrams
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Read buffer for upstream replies
    #[serde(default = "default_reply_buffer_size")]
    pub reply_buffer_size: usize,
}

impl UdpConfig {
    /// Validate UDP configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == 0 || self.dns_read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "UDP read timeouts must be greater than 0".into(),
            ));
        }
        if self.session_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "session_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.recv_buffer_size < 512 || self.reply_buffer_size < 512 {
            return Err(ConfigError::ValidationError(
                "UDP buffer sizes must be at least 512 bytes".into(),
            ));
        }
        Ok(())
    }

    /// Read timeout for a traffic class
    #[must_use]
    pub const fn read_timeout(&self, class: ProtocolClass) -> Duration {
        match class {
            ProtocolClass::Dns => Duration::from_millis(self.dns_read_timeout_ms),
            ProtocolClass::Udp | ProtocolClass::Tcp => Duration::from_millis(self.read_timeout_ms),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_udp_read_timeout_ms(),
            dns_read_timeout_ms: default_dns_read_timeout_ms(),
            session_queue_capacity: default_session_queue_capacity(),
            recv_buffer_size: default_recv_buffer_size(),
            reply_buffer_size: default_reply_buffer_size(),
        }
    }
}

/// Upstream channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Unique channel name
    pub name: String,

    /// Channel type
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Enable this channel
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelConfig {
    /// Create a direct channel configuration
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel_type: ChannelType::Direct,
            connect_timeout_secs: default_connect_timeout_secs(),
            enabled: true,
        }
    }

    /// Validate channel configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "Channel name cannot be empty".into(),
            ));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::ValidationError(format!(
                "Channel name '{}' contains invalid characters (only alphanumeric, -, _ allowed)",
                self.name
            )));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Channel '{}' connect_timeout_secs must be greater than 0",
                self.name
            )));
        }

        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Channel types supported by tproxy-tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Connect straight to the destination
    Direct,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// A routing rule. Empty `protocols` or `hosts` match anything.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteRule {
    /// Channel to use when the rule matches
    pub channel: String,

    /// Traffic classes this rule applies to
    #[serde(default)]
    pub protocols: Vec<ProtocolClass>,

    /// Destination hosts: IP literals or CIDR blocks
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl RouteRule {
    fn validate(&self, index: usize, channels: &HashSet<&str>) -> Result<(), ConfigError> {
        if !channels.contains(self.channel.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Rule {index} references unknown channel '{}'",
                self.channel
            )));
        }

        for host in &self.hosts {
            HostMatcher::parse(host).map_err(|reason| {
                ConfigError::ValidationError(format!("Rule {index}: {reason}"))
            })?;
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions

#[allow(clippy::unnecessary_wraps)]
fn default_listen_addr() -> Option<String> {
    Some("127.0.0.1:7893".into())
}

const fn default_backlog() -> u32 {
    1024
}

const fn default_udp_read_timeout_ms() -> u64 {
    15_000
}

const fn default_dns_read_timeout_ms() -> u64 {
    1_000
}

const fn default_session_queue_capacity() -> usize {
    64
}

const fn default_recv_buffer_size() -> usize {
    65_535
}

const fn default_reply_buffer_size() -> usize {
    8_192
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_socket_mark() -> u32 {
    0xff
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
