//! Session layer
//!
//! Identity types for intercepted flows, the concurrent session table and
//! the UDP session state machine.

mod key;
mod table;
mod udp;

pub use key::{AddressFamily, Endpoint, SessionKey};
pub use table::{SessionTable, SessionTableStats, SessionTableStatsSnapshot};
pub use udp::{
    dispatch_datagram, EnqueueResult, SessionConfig, SessionContext, SessionState, UdpSession,
    UdpSessionSnapshot, UdpSessionStats, UdpSessionTable,
};
