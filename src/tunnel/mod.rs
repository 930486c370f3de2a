//! Upstream tunnel layer
//!
//! The proxy core reaches upstreams only through the traits in [`traits`].
//! This module also ships the concrete pieces a runnable process needs:
//!
//! - [`ChannelManager`]: name to channel registry, implements [`TunnelProvider`]
//! - [`DirectChannel`]: connects straight to the destination
//! - [`RuleChannelSelector`]: first-match routing over configured rules

mod direct;
mod manager;
mod selector;
pub mod traits;

pub use direct::{set_routing_mark, DirectChannel, DirectTunnel};
pub use manager::ChannelManager;
pub use selector::{HostMatcher, RuleChannelSelector};
pub use traits::{
    Channel, ChannelSelector, ChannelStats, ChannelStatsSnapshot, ProtocolClass, TunnelProvider,
    UpstreamTunnel,
};
