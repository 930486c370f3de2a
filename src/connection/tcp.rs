//! TCP connection handling
//!
//! Each resolved connection is routed with class `tcp`, given its own tunnel
//! and relayed in both directions until both sides finish or one fails.
//! End of stream in one direction is propagated as a half-close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use super::stats::ConnectionStats;
use crate::error::SessionError;
use crate::session::Endpoint;
use crate::tproxy::{TransparentConnection, TransparentTcpListener};
use crate::tunnel::{ChannelSelector, ProtocolClass, TunnelProvider, UpstreamTunnel};

/// Default relay buffer size
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Shared dependencies of the TCP path
#[derive(Clone)]
pub struct TcpConnectionContext {
    /// Picks the upstream channel
    pub selector: Arc<dyn ChannelSelector>,
    /// Opens tunnels on channels
    pub tunnels: Arc<dyn TunnelProvider>,
    /// Relay buffer size per direction
    pub buffer_size: usize,
}

/// Result of handling a TCP connection
#[derive(Debug)]
pub struct TcpConnectionResult {
    /// Client endpoint
    pub client: Endpoint,
    /// Original destination
    pub original_dst: Endpoint,
    /// Channel used
    pub channel: Option<String>,
    /// Bytes copied client -> upstream
    pub bytes_up: u64,
    /// Bytes copied upstream -> client
    pub bytes_down: u64,
    /// Error message if failed
    pub error: Option<String>,
}

/// Handle a resolved TCP connection through the proxy.
///
/// Selects a channel, opens a tunnel, issues `connect("tcp", host:port)` and
/// relays until both directions reach end of stream or one fails. The
/// tunnel is closed exactly once before returning.
pub async fn handle_tcp_connection(
    conn: TransparentConnection,
    ctx: &TcpConnectionContext,
) -> TcpConnectionResult {
    let client = conn.client();
    let original_dst = conn.original_dst();
    let stream = conn.into_stream();

    let mut result = TcpConnectionResult {
        client,
        original_dst,
        channel: None,
        bytes_up: 0,
        bytes_down: 0,
        error: None,
    };

    let host = original_dst.host();
    let target = original_dst.host_port();

    let Some(channel) = ctx.selector.select_channel(ProtocolClass::Tcp, &host) else {
        let e = SessionError::route_not_found(ProtocolClass::Tcp.as_str(), host);
        warn!("Dropping {} -> {}: {}", client, original_dst, e);
        result.error = Some(e.to_string());
        return result;
    };
    result.channel = Some(channel.clone());

    let tunnel = match ctx.tunnels.open_tunnel(&channel).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let e = SessionError::upstream_connect(&channel, &target, e.to_string());
            warn!("{}", e);
            result.error = Some(e.to_string());
            return result;
        }
    };

    if let Err(e) = tunnel
        .connect(ProtocolClass::Tcp.transport(), &target)
        .await
    {
        tunnel.close().await;
        let e = SessionError::upstream_connect(&channel, &target, e.to_string());
        warn!("{}", e);
        result.error = Some(e.to_string());
        return result;
    }

    info!("Proxying {} -> {} via {}", client, original_dst, channel);

    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);
    let outcome = relay(stream, &*tunnel, ctx.buffer_size, &up, &down).await;
    tunnel.close().await;

    result.bytes_up = up.load(Ordering::Relaxed);
    result.bytes_down = down.load(Ordering::Relaxed);

    match outcome {
        Ok(()) => info!(
            "Connection closed: {} -> {}, {} up / {} down bytes",
            client, original_dst, result.bytes_up, result.bytes_down
        ),
        Err(e) => {
            debug!(
                "Connection error: {} -> {}: {} ({} up / {} down bytes)",
                client, original_dst, e, result.bytes_up, result.bytes_down
            );
            result.error = Some(e.to_string());
        }
    }

    result
}

/// Copy bytes both ways until both directions finish.
///
/// Client EOF half-closes the upstream write side and upstream EOF shuts down
/// the client write side; the other direction keeps running. An error in
/// either direction ends the relay.
async fn relay(
    stream: TcpStream,
    tunnel: &dyn UpstreamTunnel,
    buffer_size: usize,
    up: &AtomicU64,
    down: &AtomicU64,
) -> Result<(), SessionError> {
    let (mut reader, mut writer) = stream.into_split();
    let buffer_size = buffer_size.max(1);

    let client_to_upstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| SessionError::forward("client->upstream", e.to_string()))?;
            if n == 0 {
                return tunnel
                    .shutdown_write()
                    .await
                    .map_err(|e| SessionError::forward("client->upstream", e.to_string()));
            }
            tunnel
                .write(&buf[..n])
                .await
                .map_err(|e| SessionError::forward("client->upstream", e.to_string()))?;
            up.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = tunnel
                .read(&mut buf)
                .await
                .map_err(|e| SessionError::forward("upstream->client", e.to_string()))?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok::<(), SessionError>(());
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| SessionError::forward("upstream->client", e.to_string()))?;
            down.fetch_add(n as u64, Ordering::Relaxed);
        }
    };

    tokio::try_join!(client_to_upstream, upstream_to_client).map(|_| ())
}

/// Spawn a task to handle a TCP connection with proper instrumentation
pub fn spawn_tcp_handler(
    conn: TransparentConnection,
    ctx: Arc<TcpConnectionContext>,
    stats: Arc<ConnectionStats>,
) -> tokio::task::JoinHandle<()> {
    let span = info_span!(
        "tcp_connection",
        client = %conn.client(),
        dst = %conn.original_dst(),
    );

    stats.record_accepted();
    tokio::spawn(
        async move {
            let result = handle_tcp_connection(conn, &ctx).await;
            if result.error.is_none() {
                stats.record_completed(result.bytes_up, result.bytes_down);
            } else {
                stats.record_error(result.bytes_up, result.bytes_down);
            }
        }
        .instrument(span),
    )
}

/// Run the TCP accept loop until `shutdown` fires.
///
/// Connections whose destination cannot be resolved are logged and dropped;
/// the loop keeps accepting.
pub async fn run_accept_loop(
    listener: TransparentTcpListener,
    ctx: Arc<TcpConnectionContext>,
    stats: Arc<ConnectionStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Starting TCP accept loop on {}", listener.listen_addr());

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("TCP accept loop on {} stopping", listener.listen_addr());
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    spawn_tcp_handler(conn, Arc::clone(&ctx), Arc::clone(&stats));
                }
                Err(e) => {
                    stats.record_unresolved();
                    warn!("Dropping TCP connection: {}", e);
                }
            },
        }
    }
}
