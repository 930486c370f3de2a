//! Channel Manager
//!
//! Registry of configured upstream channels, keyed by name.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::direct::DirectChannel;
use super::traits::{Channel, ChannelStatsSnapshot, TunnelProvider, UpstreamTunnel};
use crate::config::{ChannelType, Config};
use crate::error::TunnelError;

/// Manages all configured channels
pub struct ChannelManager {
    channels: DashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    /// Create an empty channel manager
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Build a manager holding every channel in `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let manager = Self::new();
        for channel in &config.channels {
            match channel.channel_type {
                ChannelType::Direct => {
                    manager.add(Arc::new(DirectChannel::from_config(channel, config.socket_mark)));
                }
            }
        }
        manager
    }

    /// Add a channel, replacing any channel with the same name
    pub fn add(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(
            "Adding channel: {} (type: {})",
            name,
            channel.channel_type()
        );
        self.channels.insert(name, channel);
    }

    /// Get a channel by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Remove a channel by name
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Channel>> {
        info!("Removing channel: {}", name);
        self.channels.remove(name).map(|(_, v)| v)
    }

    /// Check if a channel exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// All channel names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no channels
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Stats of every channel, sorted by name
    #[must_use]
    pub fn stats_snapshot(&self) -> Vec<(String, ChannelStatsSnapshot)> {
        let mut stats: Vec<_> = self
            .channels
            .iter()
            .map(|r| (r.key().clone(), r.value().stats().snapshot()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProvider for ChannelManager {
    async fn open_tunnel(&self, channel: &str) -> Result<Arc<dyn UpstreamTunnel>, TunnelError> {
        let Some(handle) = self.get(channel) else {
            return Err(TunnelError::ChannelNotFound(channel.to_string()));
        };
        debug!("Opening tunnel on channel {}", channel);
        handle.open().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_config() {
        let config = Config::default_config();
        let manager = ChannelManager::from_config(&config);
        assert_eq!(manager.names(), vec!["direct".to_string()]);
        assert_eq!(manager.get("direct").unwrap().channel_type(), "direct");
    }

    #[test]
    fn test_add_remove() {
        let manager = ChannelManager::new();
        assert!(manager.is_empty());

        manager.add(Arc::new(DirectChannel::new("a", Duration::from_secs(1), None)));
        manager.add(Arc::new(DirectChannel::new("b", Duration::from_secs(1), None)));
        assert_eq!(manager.len(), 2);
        assert!(manager.contains("a"));

        assert!(manager.remove("a").is_some());
        assert!(!manager.contains("a"));
        assert!(manager.remove("a").is_none());
    }

    #[tokio::test]
    async fn test_open_unknown_channel() {
        let manager = ChannelManager::new();
        let result = manager.open_tunnel("missing").await;
        assert!(matches!(result, Err(TunnelError::ChannelNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_open_tunnel() {
        let manager = ChannelManager::new();
        manager.add(Arc::new(DirectChannel::new("up", Duration::from_secs(1), None)));
        let tunnel = manager.open_tunnel("up").await.unwrap();
        assert_eq!(tunnel.channel(), "up");
    }

    #[test]
    fn test_stats_snapshot_sorted() {
        let manager = ChannelManager::new();
        manager.add(Arc::new(DirectChannel::new("z", Duration::from_secs(1), None)));
        manager.add(Arc::new(DirectChannel::new("a", Duration::from_secs(1), None)));
        let stats = manager.stats_snapshot();
        assert_eq!(stats[0].0, "a");
        assert_eq!(stats[1].1, ChannelStatsSnapshot::default());
    }
}
