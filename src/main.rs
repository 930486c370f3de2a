//! tproxy-tunnel: transparent proxy forwarding into upstream tunnels
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tproxy-tunnel
//!
//! # Run with custom configuration
//! sudo ./tproxy-tunnel -c /path/to/config.json
//!
//! # Run with environment overrides
//! TPROXY_TUNNEL_LOG_LEVEL=debug sudo ./tproxy-tunnel
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tproxy_tunnel::config::{load_config_with_env, Config};
use tproxy_tunnel::connection::{
    run_accept_loop, ConnectionStats, TcpConnectionContext, DEFAULT_RELAY_BUFFER_SIZE,
};
use tproxy_tunnel::session::{SessionConfig, SessionContext, UdpSessionTable};
use tproxy_tunnel::tproxy::{
    default_socket_provider, has_net_admin_capability, is_root, SocketProvider,
    TransparentReplyWriter, TransparentTcpListener, TransparentUdpListener,
};
use tproxy_tunnel::tunnel::{ChannelManager, ChannelSelector, RuleChannelSelector, TunnelProvider};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tproxy-tunnel/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tproxy-tunnel v{}", tproxy_tunnel::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tproxy-tunnel v{}

Transparent proxy that forwards TPROXY-intercepted traffic into upstream tunnels.

USAGE:
    tproxy-tunnel [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tproxy-tunnel/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    TPROXY_TUNNEL_UDP_LISTEN     Override UDP listen address (empty disables UDP)
    TPROXY_TUNNEL_TCP_LISTEN     Override TCP listen address (empty disables TCP)
    TPROXY_TUNNEL_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    TPROXY_TUNNEL_SOCKET_MARK    Override SO_MARK for outbound sockets (decimal or 0x hex)

REQUIREMENTS:
    - Linux kernel with TPROXY support
    - CAP_NET_ADMIN capability (or root)
    - iptables TPROXY rules configured

EXAMPLE:
    iptables -t mangle -A PREROUTING -i wg-ingress -p udp -j TPROXY \
        --on-ip 127.0.0.1 --on-port 7893 --tproxy-mark 0x1
    ip rule add fwmark 0x1 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100

    sudo tproxy-tunnel -c /etc/tproxy-tunnel/config.json
"#,
        tproxy_tunnel::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("TPROXY requires CAP_NET_ADMIN capability");
        // Socket setup reports the precise failure
    }
}

/// Bind the UDP listener and spawn its receive loop
fn start_udp(
    addr: &str,
    config: &Config,
    provider: &Arc<dyn SocketProvider>,
    selector: &Arc<dyn ChannelSelector>,
    tunnels: &Arc<dyn TunnelProvider>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(JoinHandle<()>, Arc<UdpSessionTable>)> {
    let listener = TransparentUdpListener::bind(addr, provider.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to create UDP listener on {addr}: {e}"))?
        .with_recv_buffer_size(config.udp.recv_buffer_size);

    let table = Arc::new(UdpSessionTable::new());
    let ctx = SessionContext {
        selector: Arc::clone(selector),
        tunnels: Arc::clone(tunnels),
        replies: Arc::new(TransparentReplyWriter::new(Arc::clone(provider))),
        config: SessionConfig::from(&config.udp),
    };

    let sessions = Arc::clone(&table);
    let handle = tokio::spawn(async move {
        listener.run(shutdown, sessions, ctx).await;
        let stats = listener.stats().snapshot();
        info!(
            "UDP stats: {} packets, {} bytes, {} recv errors, {} decode errors, {} dropped",
            stats.packets_received,
            stats.bytes_received,
            stats.recv_errors,
            stats.decode_errors,
            stats.dropped
        );
    });

    Ok((handle, table))
}

/// Bind the TCP listener and spawn its accept loop
fn start_tcp(
    addr: &str,
    config: &Config,
    provider: &Arc<dyn SocketProvider>,
    selector: &Arc<dyn ChannelSelector>,
    tunnels: &Arc<dyn TunnelProvider>,
    stats: &Arc<ConnectionStats>,
    shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let listener = TransparentTcpListener::bind(addr, config.listen.tcp_backlog, provider.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to create TCP listener on {addr}: {e}"))?;

    let ctx = Arc::new(TcpConnectionContext {
        selector: Arc::clone(selector),
        tunnels: Arc::clone(tunnels),
        buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
    });

    Ok(tokio::spawn(run_accept_loop(
        listener,
        ctx,
        Arc::clone(stats),
        shutdown,
    )))
}

/// Listeners that started
struct Listeners {
    handles: Vec<JoinHandle<()>>,
    udp_table: Option<Arc<UdpSessionTable>>,
    tcp_started: bool,
}

/// Start every configured listener.
///
/// A listener that fails setup is logged and skipped; the others still start.
fn start_listeners(
    config: &Config,
    provider: &Arc<dyn SocketProvider>,
    selector: &Arc<dyn ChannelSelector>,
    tunnels: &Arc<dyn TunnelProvider>,
    tcp_stats: &Arc<ConnectionStats>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Listeners {
    let mut handles = Vec::new();
    let mut tcp_started = false;

    let udp_table = config.listen.udp.as_deref().and_then(|addr| {
        match start_udp(addr, config, provider, selector, tunnels, shutdown_tx.subscribe()) {
            Ok((handle, table)) => {
                handles.push(handle);
                Some(table)
            }
            Err(e) => {
                error!("{}, UDP listener not started", e);
                None
            }
        }
    });

    if let Some(addr) = config.listen.tcp.as_deref() {
        match start_tcp(
            addr,
            config,
            provider,
            selector,
            tunnels,
            tcp_stats,
            shutdown_tx.subscribe(),
        ) {
            Ok(handle) => {
                handles.push(handle);
                tcp_started = true;
            }
            Err(e) => error!("{}, TCP listener not started", e),
        }
    }

    Listeners {
        handles,
        udp_table,
        tcp_started,
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        tproxy_tunnel::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tproxy-tunnel v{}", tproxy_tunnel::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    check_prerequisites();

    let provider = default_socket_provider();
    let manager = ChannelManager::from_config(&config);
    info!("Initialized {} channels: {:?}", manager.len(), manager.names());
    let manager = Arc::new(manager);
    let tunnels: Arc<dyn TunnelProvider> = Arc::clone(&manager) as Arc<dyn TunnelProvider>;
    let selector: Arc<dyn ChannelSelector> = Arc::new(RuleChannelSelector::from_config(&config));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let tcp_stats = Arc::new(ConnectionStats::new());

    let Listeners {
        handles,
        udp_table,
        tcp_started,
    } = start_listeners(
        &config,
        &provider,
        &selector,
        &tunnels,
        &tcp_stats,
        &shutdown_tx,
    );
    if handles.is_empty() {
        anyhow::bail!("No listener started");
    }

    info!(
        "tproxy-tunnel ready (UDP: {}, TCP: {})",
        udp_table
            .as_ref()
            .and(config.listen.udp.as_deref())
            .unwrap_or("disabled"),
        config
            .listen
            .tcp
            .as_deref()
            .filter(|_| tcp_started)
            .unwrap_or("disabled")
    );
    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    let _ = shutdown_tx.send(());

    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Listener task did not stop within 5s");
        }
    }

    if let Some(table) = udp_table {
        let sessions = table.values();
        info!("Closing {} UDP sessions", sessions.len());
        for session in sessions {
            session.close().await;
        }
    }

    let stats = tcp_stats.snapshot();
    info!(
        "Final TCP stats: {} total connections, {} completed, {} errored, {} unresolved",
        stats.total_accepted, stats.completed, stats.errored, stats.unresolved
    );
    info!(
        "Transferred: {} bytes up, {} bytes down",
        stats.bytes_up, stats.bytes_down
    );
    for (name, channel) in manager.stats_snapshot() {
        info!(
            "Channel {}: {} tunnels opened, {} failed",
            name, channel.opened, channel.failed
        );
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tproxy_tunnel::tproxy::UnprivilegedSocketProvider;

    struct Harness {
        provider: Arc<dyn SocketProvider>,
        selector: Arc<dyn ChannelSelector>,
        tunnels: Arc<dyn TunnelProvider>,
        stats: Arc<ConnectionStats>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                provider: Arc::new(UnprivilegedSocketProvider::new()),
                selector: Arc::new(RuleChannelSelector::fixed("direct")),
                tunnels: Arc::new(ChannelManager::new()),
                stats: Arc::new(ConnectionStats::new()),
                shutdown_tx: broadcast::channel(1).0,
            }
        }

        fn start(&self, udp: Option<String>, tcp: Option<String>) -> Listeners {
            let mut config = Config::default_config();
            config.listen.udp = udp;
            config.listen.tcp = tcp;
            start_listeners(
                &config,
                &self.provider,
                &self.selector,
                &self.tunnels,
                &self.stats,
                &self.shutdown_tx,
            )
        }

        async fn stop(&self, listeners: Listeners) {
            let _ = self.shutdown_tx.send(());
            for handle in listeners.handles {
                tokio::time::timeout(Duration::from_secs(2), handle)
                    .await
                    .unwrap()
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_udp_setup_failure_still_starts_tcp() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let busy = holder.local_addr().unwrap().to_string();

        let harness = Harness::new();
        let listeners = harness.start(Some(busy), Some("127.0.0.1:0".into()));

        assert!(listeners.udp_table.is_none());
        assert!(listeners.tcp_started);
        assert_eq!(listeners.handles.len(), 1);
        harness.stop(listeners).await;
    }

    #[tokio::test]
    async fn test_tcp_setup_failure_keeps_udp() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = holder.local_addr().unwrap().to_string();

        let harness = Harness::new();
        let listeners = harness.start(Some("127.0.0.1:0".into()), Some(busy));

        assert!(listeners.udp_table.is_some());
        assert!(!listeners.tcp_started);
        assert_eq!(listeners.handles.len(), 1);
        harness.stop(listeners).await;
    }

    #[tokio::test]
    async fn test_all_listeners_failing_starts_nothing() {
        let udp_holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let tcp_holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let harness = Harness::new();
        let listeners = harness.start(
            Some(udp_holder.local_addr().unwrap().to_string()),
            Some(tcp_holder.local_addr().unwrap().to_string()),
        );

        assert!(listeners.handles.is_empty());
        assert!(listeners.udp_table.is_none());
        assert!(!listeners.tcp_started);
    }
}
