//! Configuration module for tproxy-tunnel
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tproxy_tunnel::config::load_config;
//!
//! let config = load_config("/etc/tproxy-tunnel/config.json").unwrap();
//! println!("Channels: {}", config.channels.len());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str, load_config_with_env,
};
pub use types::{
    ChannelConfig, ChannelType, Config, ListenConfig, LogConfig, RouteRule, UdpConfig,
};
