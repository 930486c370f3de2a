//! Integration tests for tproxy-tunnel
//!
//! # Test Organization
//!
//! - `mocks`: in-memory tunnel, provider, selector and reply writer
//! - `udp_session`: session lifecycle through `dispatch_datagram`
//! - `udp_listener`: loopback listener with real ancillary data
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! cargo test --test integration_tests udp_session
//! ```
//!
//! # Test Requirements
//!
//! No test needs `CAP_NET_ADMIN`: sockets come from the unprivileged
//! provider and upstreams are mocked.

pub mod mocks;
pub mod udp_listener;
pub mod udp_session;
