//! Connection handling module
//!
//! This module provides the TCP side of the proxy:
//! - Accept loop with shutdown
//! - Per-connection routing and stream relay
//! - Statistics collection

mod stats;
mod tcp;

pub use stats::{ConnectionStats, StatsSnapshot};
pub use tcp::{
    handle_tcp_connection, run_accept_loop, spawn_tcp_handler, TcpConnectionContext,
    TcpConnectionResult, DEFAULT_RELAY_BUFFER_SIZE,
};
