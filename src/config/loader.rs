//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: {} channels, {} rules, default={}",
        config.channels.len(),
        config.rules.len(),
        config.default_channel.as_deref().unwrap_or("<none>")
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TPROXY_TUNNEL_UDP_LISTEN`: Override UDP listen address (empty disables)
/// - `TPROXY_TUNNEL_TCP_LISTEN`: Override TCP listen address (empty disables)
/// - `TPROXY_TUNNEL_LOG_LEVEL`: Override log level
/// - `TPROXY_TUNNEL_SOCKET_MARK`: Override outbound socket mark (decimal or 0x hex)
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or re-validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from `lookup` (normally the process environment), then
/// re-validate.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparseable values, or
/// `ConfigError::ValidationError` if the result is invalid.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("TPROXY_TUNNEL_UDP_LISTEN") {
        config.listen.udp = Some(addr).filter(|a| !a.is_empty());
        debug!("UDP listen address overridden to {:?}", config.listen.udp);
    }

    if let Some(addr) = lookup("TPROXY_TUNNEL_TCP_LISTEN") {
        config.listen.tcp = Some(addr).filter(|a| !a.is_empty());
        debug!("TCP listen address overridden to {:?}", config.listen.tcp);
    }

    if let Some(level) = lookup("TPROXY_TUNNEL_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(mark) = lookup("TPROXY_TUNNEL_SOCKET_MARK") {
        let parsed = match mark.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => mark.parse(),
        };
        config.socket_mark = Some(parsed.map_err(|_| ConfigError::EnvError {
            name: "TPROXY_TUNNEL_SOCKET_MARK".into(),
            reason: format!("Invalid mark: {mark}"),
        })?);
        debug!("Socket mark overridden to {:?}", config.socket_mark);
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
