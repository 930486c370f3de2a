//! Transparent proxy kernel boundary
//!
//! Everything that touches TPROXY sockets lives here: socket creation,
//! original destination recovery for TCP (socket-option queries) and UDP
//! (ancillary data), the forged-source reply writer, and both listeners.
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support
//! - `CAP_NET_ADMIN` capability (or root)
//! - iptables with TPROXY target (`xt_TPROXY` module)
//!
//! ## Required sysctl Settings
//!
//! ```bash
//! # Allow routing to 127.0.0.0/8 (required for TPROXY --on-ip 127.0.0.1)
//! sysctl -w net.ipv4.conf.all.route_localnet=1
//!
//! # Allow binding to non-local addresses (required for reply sockets)
//! sysctl -w net.ipv4.ip_nonlocal_bind=1
//!
//! # Disable reverse path filtering (required for TPROXY packets)
//! sysctl -w net.ipv4.conf.all.rp_filter=0
//! ```
//!
//! | Setting | Purpose |
//! |---------|---------|
//! | `route_localnet=1` | TPROXY uses `--on-ip 127.0.0.1`. Without this the kernel drops 127.0.0.0/8 traffic as martian. |
//! | `ip_nonlocal_bind=1` | Reply sockets bind to the original destination, a non-local address. Without this `bind()` fails with `EADDRNOTAVAIL`. |
//! | `rp_filter=0` | Redirected packets can fail the reverse path check. |
//!
//! ## Example iptables Setup
//!
//! ```bash
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//!
//! iptables -t mangle -N DIVERT
//! iptables -t mangle -A DIVERT -j MARK --set-mark 0x1
//! iptables -t mangle -A DIVERT -j ACCEPT
//! iptables -t mangle -A PREROUTING -p tcp -m socket --transparent -j DIVERT
//! iptables -t mangle -A PREROUTING -p udp -m socket --transparent -j DIVERT
//!
//! iptables -t mangle -A PREROUTING -i wg-ingress -p tcp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! iptables -t mangle -A PREROUTING -i wg-ingress -p udp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tproxy_tunnel::tproxy::{TransparentUdpListener, TransparentSocketProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = TransparentSocketProvider::new();
//! let listener = TransparentUdpListener::bind("127.0.0.1:7893", &provider)?;
//!
//! let mut buf = vec![0u8; 65535];
//! let packet = listener.recv(&mut buf).await?;
//! println!("UDP: {} -> {} ({} bytes)", packet.client, packet.original_dst, packet.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Troubleshooting
//!
//! ## Permission Denied Errors
//!
//! TPROXY requires `CAP_NET_ADMIN`. Run as root or with:
//! ```bash
//! setcap cap_net_admin+ep ./tproxy-tunnel
//! ```

pub mod cmsg;
mod listener;
mod reply;
mod resolver;
mod socket;
mod udp_listener;

pub use cmsg::{decode_original_dst, ControlMessage, ControlMessages};
pub use listener::{TransparentTcpListener, DEFAULT_BACKLOG};
pub use reply::{ReplyWriter, ReplyWriterStats, ReplyWriterStatsSnapshot, TransparentReplyWriter};
pub use resolver::{resolve_original_dst, ResolveStrategy, TransparentConnection, RESOLVE_ORDER};
pub use socket::{
    default_socket_provider, domain, has_net_admin_capability, is_root, set_recv_orig_dst,
    set_transparent, SocketProvider, TransparentSocketProvider, UnprivilegedSocketProvider,
    IP6T_SO_ORIGINAL_DST, IPV6_RECVORIGDSTADDR, IPV6_TRANSPARENT, IP_RECVORIGDSTADDR,
    IP_TRANSPARENT, SO_ORIGINAL_DST,
};
pub use udp_listener::{
    parse_listen_addr, TransparentUdpListener, UdpListenerStats, UdpListenerStatsSnapshot,
    UdpPacketInfo, DEFAULT_RECV_BUFFER_SIZE,
};
