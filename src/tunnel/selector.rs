//! Rule-based channel selection
//!
//! Rules are checked in order; the first rule whose protocol list and host
//! list both match picks the channel. Unmatched traffic goes to the default
//! channel, or has no route when there is none.

use std::net::IpAddr;

use tracing::trace;

use super::traits::{ChannelSelector, ProtocolClass};
use crate::config::{Config, RouteRule};

/// Matches one destination host entry from a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatcher {
    /// A single address
    Exact(IpAddr),
    /// An address block, `network/prefix`
    Cidr { network: IpAddr, prefix: u8 },
    /// A host name, compared case-insensitively
    Name(String),
}

impl HostMatcher {
    /// Parse an IP literal, a CIDR block or a host name
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for malformed CIDR blocks or
    /// empty entries.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty host entry".into());
        }

        if let Some((network, prefix)) = s.split_once('/') {
            let network: IpAddr = network
                .parse()
                .map_err(|_| format!("invalid network address in '{s}'"))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| format!("invalid prefix length in '{s}'"))?;
            let max = match network {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(format!("prefix length {prefix} exceeds {max} in '{s}'"));
            }
            return Ok(Self::Cidr { network, prefix });
        }

        Ok(s.parse::<IpAddr>()
            .map_or_else(|_| Self::Name(s.to_ascii_lowercase()), Self::Exact))
    }

    /// Check whether `host` matches
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Name(name) => host.eq_ignore_ascii_case(name),
            Self::Exact(ip) => host.parse::<IpAddr>().is_ok_and(|h| h == *ip),
            Self::Cidr { network, prefix } => host
                .parse::<IpAddr>()
                .is_ok_and(|h| cidr_contains(*network, *prefix, h)),
        }
    }
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    channel: String,
    protocols: Vec<ProtocolClass>,
    hosts: Vec<HostMatcher>,
}

impl CompiledRule {
    fn matches(&self, class: ProtocolClass, host: &str) -> bool {
        (self.protocols.is_empty() || self.protocols.contains(&class))
            && (self.hosts.is_empty() || self.hosts.iter().any(|m| m.matches(host)))
    }
}

/// First-match-wins selector over configured rules
#[derive(Debug, Clone, Default)]
pub struct RuleChannelSelector {
    rules: Vec<CompiledRule>,
    default_channel: Option<String>,
}

impl RuleChannelSelector {
    /// Build a selector. Host entries that fail to parse are skipped.
    #[must_use]
    pub fn new(rules: &[RouteRule], default_channel: Option<String>) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                channel: rule.channel.clone(),
                protocols: rule.protocols.clone(),
                hosts: rule
                    .hosts
                    .iter()
                    .filter_map(|h| HostMatcher::parse(h).ok())
                    .collect(),
            })
            .collect();

        Self {
            rules,
            default_channel,
        }
    }

    /// Build a selector from a validated configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.rules, config.default_channel.clone())
    }

    /// Selector that sends everything to `channel`
    #[must_use]
    pub fn fixed(channel: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_channel: Some(channel.into()),
        }
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl ChannelSelector for RuleChannelSelector {
    fn select_channel(&self, class: ProtocolClass, host: &str) -> Option<String> {
        let selected = self
            .rules
            .iter()
            .find(|rule| rule.matches(class, host))
            .map(|rule| rule.channel.clone())
            .or_else(|| self.default_channel.clone());

        trace!("Route {} {} -> {:?}", class, host, selected);
        selected
    }
}
