//! UDP session state machine
//!
//! One [`UdpSession`] exists per live (client, original destination) pair.
//!
//! ```text
//!   New ──first packet──► Connecting ──tunnel connected──► Forwarding
//!    │                        │                               │
//!    └────────────────────────┴──────────► Closed ◄───────────┘
//! ```
//!
//! The creating path starts two tasks:
//!
//! - the **driver** takes queued client datagrams, performs routing and
//!   tunnel setup on the first one, then forwards every datagram to the
//!   tunnel with exactly one write each, in arrival order
//! - the **reader** (spawned on entering Forwarding) reads upstream data with
//!   a per-read deadline and sends each chunk back through the reply writer
//!
//! DNS sessions (destination port 53) end after the first upstream read.
//! Every other session ends on upstream EOF, read error or read timeout.
//! Closing is idempotent: the tunnel is closed and the session removes
//! itself from the table.

use std::fmt;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, OnceCell};
use tracing::{debug, info_span, trace, warn, Instrument};

use super::key::SessionKey;
use super::table::SessionTable;
use crate::config::UdpConfig;
use crate::error::{SessionError, TunnelError};
use crate::tproxy::ReplyWriter;
use crate::tunnel::{ChannelSelector, ProtocolClass, TunnelProvider, UpstreamTunnel};

/// Table of live UDP sessions
pub type UdpSessionTable = SessionTable<Arc<UdpSession>>;

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// Created, no packet processed yet
    New = 0,
    /// Routing and tunnel setup in progress
    Connecting = 1,
    /// Tunnel connected, relaying in both directions
    Forwarding = 2,
    /// Terminal
    Closed = 3,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Forwarding,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Connecting => write!(f, "connecting"),
            Self::Forwarding => write!(f, "forwarding"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Session timing and buffer settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upstream read timeout for generic UDP sessions
    pub udp_read_timeout: Duration,
    /// Upstream read timeout for DNS sessions
    pub dns_read_timeout: Duration,
    /// Client datagrams buffered per session
    pub queue_capacity: usize,
    /// Upstream read buffer size
    pub reply_buffer_size: usize,
}

impl SessionConfig {
    /// Read timeout for a traffic class
    #[must_use]
    pub const fn read_timeout(&self, class: ProtocolClass) -> Duration {
        match class {
            ProtocolClass::Dns => self.dns_read_timeout,
            ProtocolClass::Udp | ProtocolClass::Tcp => self.udp_read_timeout,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&UdpConfig::default())
    }
}

impl From<&UdpConfig> for SessionConfig {
    fn from(config: &UdpConfig) -> Self {
        Self {
            udp_read_timeout: config.read_timeout(ProtocolClass::Udp),
            dns_read_timeout: config.read_timeout(ProtocolClass::Dns),
            queue_capacity: config.session_queue_capacity,
            reply_buffer_size: config.reply_buffer_size,
        }
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    /// Picks the upstream channel
    pub selector: Arc<dyn ChannelSelector>,
    /// Opens tunnels on channels
    pub tunnels: Arc<dyn TunnelProvider>,
    /// Sends replies with forged source
    pub replies: Arc<dyn ReplyWriter>,
    /// Timing and buffers
    pub config: SessionConfig,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Result of handing a datagram to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Queued for forwarding
    Queued,
    /// Queue full, datagram dropped
    Full,
    /// Session already closed, datagram not accepted
    Closed,
}

/// Per-session counters
#[derive(Debug, Default)]
pub struct UdpSessionStats {
    /// Datagrams written to the tunnel
    pub packets_up: AtomicU64,
    /// Bytes written to the tunnel
    pub bytes_up: AtomicU64,
    /// Chunks read from the tunnel
    pub packets_down: AtomicU64,
    /// Bytes read from the tunnel
    pub bytes_down: AtomicU64,
    /// Client datagrams dropped on a full queue
    pub dropped: AtomicU64,
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct UdpSessionSnapshot {
    pub key: String,
    pub class: ProtocolClass,
    pub state: SessionState,
    pub channel: Option<String>,
    pub packets_up: u64,
    pub bytes_up: u64,
    pub packets_down: u64,
    pub bytes_down: u64,
    pub dropped: u64,
    pub age_ms: u64,
}

/// One UDP flow between a client and its original destination
pub struct UdpSession {
    key: SessionKey,
    class: ProtocolClass,
    read_timeout: Duration,
    state: AtomicU8,
    upstream: OnceCell<Arc<dyn UpstreamTunnel>>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown: Notify,
    table: Weak<UdpSessionTable>,
    stats: UdpSessionStats,
    created_at: Instant,
}

impl UdpSession {
    /// Create a session in state `New`. Nothing runs until [`start`](Self::start).
    ///
    /// The class is derived from the destination port.
    #[must_use]
    pub fn new(key: SessionKey, config: &SessionConfig, table: &Arc<UdpSessionTable>) -> Arc<Self> {
        let class = ProtocolClass::classify_udp(key.remote.port());
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));

        Arc::new(Self {
            key,
            class,
            read_timeout: config.read_timeout(class),
            state: AtomicU8::new(SessionState::New as u8),
            upstream: OnceCell::new(),
            inbound_tx,
            inbound_rx: parking_lot::Mutex::new(Some(inbound_rx)),
            shutdown: Notify::new(),
            table: Arc::downgrade(table),
            stats: UdpSessionStats::default(),
            created_at: Instant::now(),
        })
    }

    /// Session key
    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.key
    }

    /// Traffic class
    #[must_use]
    pub const fn class(&self) -> ProtocolClass {
        self.class
    }

    /// Upstream read timeout in effect
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the session reached `Closed`
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Session counters
    #[must_use]
    pub const fn stats(&self) -> &UdpSessionStats {
        &self.stats
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Spawn the session's driver task. Only the creating path calls this;
    /// later calls do nothing.
    pub fn start(self: &Arc<Self>, ctx: SessionContext) {
        let Some(rx) = self.inbound_rx.lock().take() else {
            return;
        };

        let span = info_span!("udp_session", key = %self.key, class = %self.class);
        tokio::spawn(Arc::clone(self).drive(rx, ctx).instrument(span));
    }

    /// Queue a client datagram for forwarding
    pub fn enqueue(&self, data: Bytes) -> EnqueueResult {
        if self.is_closed() {
            return EnqueueResult::Closed;
        }
        match self.inbound_tx.try_send(data) {
            Ok(()) => EnqueueResult::Queued,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueResult::Full
            }
            Err(TrySendError::Closed(_)) => EnqueueResult::Closed,
        }
    }

    /// Close the session: close the tunnel and leave the table.
    ///
    /// Idempotent. A newer session that reused the key is left in place.
    pub async fn close(self: &Arc<Self>) {
        let previous = SessionState::from_u8(
            self.state.swap(SessionState::Closed as u8, Ordering::SeqCst),
        );
        if previous == SessionState::Closed {
            return;
        }

        self.shutdown.notify_one();

        // Pairs with the fence in open_upstream: either we see the tunnel
        // or the opener sees Closed
        fence(Ordering::SeqCst);
        if let Some(tunnel) = self.upstream.get() {
            tunnel.close().await;
        }

        if let Some(table) = self.table.upgrade() {
            table.remove_if(&self.key, |s| Arc::ptr_eq(s, self));
        }

        debug!(
            "UDP session {} closed (was {}, up {} pkts, down {} pkts)",
            self.key,
            previous,
            self.stats.packets_up.load(Ordering::Relaxed),
            self.stats.packets_down.load(Ordering::Relaxed)
        );
    }

    /// Serializable snapshot
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot(&self) -> UdpSessionSnapshot {
        UdpSessionSnapshot {
            key: self.key.to_string(),
            class: self.class,
            state: self.state(),
            channel: self.upstream.get().map(|t| t.channel().to_string()),
            packets_up: self.stats.packets_up.load(Ordering::Relaxed),
            bytes_up: self.stats.bytes_up.load(Ordering::Relaxed),
            packets_down: self.stats.packets_down.load(Ordering::Relaxed),
            bytes_down: self.stats.bytes_down.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }

    async fn drive(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>, ctx: SessionContext) {
        let first = tokio::select! {
            biased;
            () = self.shutdown.notified() => return,
            packet = rx.recv() => packet,
        };
        let Some(first) = first else {
            self.close().await;
            return;
        };

        if !self.transition(SessionState::New, SessionState::Connecting) {
            return;
        }

        let tunnel = match self.open_upstream(&ctx).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("UDP session {} setup failed: {}", self.key, e);
                self.close().await;
                return;
            }
        };

        if !self.transition(SessionState::Connecting, SessionState::Forwarding) {
            // Closed while connecting; close() already shut the tunnel
            return;
        }

        let reader = Arc::clone(&self).read_upstream(
            Arc::clone(&tunnel),
            Arc::clone(&ctx.replies),
            ctx.config.reply_buffer_size,
        );
        tokio::spawn(reader.in_current_span());

        if let Err(e) = self.forward(&*tunnel, &first).await {
            debug!("UDP session {}: {}", self.key, e);
            self.close().await;
            return;
        }

        loop {
            let packet = tokio::select! {
                biased;
                () = self.shutdown.notified() => break,
                packet = rx.recv() => packet,
            };
            let Some(packet) = packet else { break };

            if let Err(e) = self.forward(&*tunnel, &packet).await {
                debug!("UDP session {}: {}", self.key, e);
                self.close().await;
                break;
            }
        }
    }

    async fn open_upstream(&self, ctx: &SessionContext) -> Result<Arc<dyn UpstreamTunnel>, SessionError> {
        let host = self.key.remote.host();
        let target = self.key.remote.host_port();

        let channel = ctx
            .selector
            .select_channel(self.class, &host)
            .ok_or_else(|| SessionError::route_not_found(self.class.as_str(), host))?;

        let tunnel = ctx
            .tunnels
            .open_tunnel(&channel)
            .await
            .map_err(|e| SessionError::upstream_connect(&channel, &target, e.to_string()))?;

        if self.upstream.set(Arc::clone(&tunnel)).is_err() {
            tunnel.close().await;
            return Err(SessionError::upstream_connect(
                &channel,
                &target,
                "upstream already assigned",
            ));
        }

        // A concurrent close() may have missed the tunnel; honour it now
        fence(Ordering::SeqCst);
        if self.is_closed() {
            tunnel.close().await;
            return Err(SessionError::Closed);
        }

        tunnel
            .connect(self.class.transport(), &target)
            .await
            .map_err(|e| SessionError::upstream_connect(&channel, &target, e.to_string()))?;

        debug!(
            "UDP session {} forwarding via {} ({})",
            self.key, channel, self.class
        );
        Ok(tunnel)
    }

    async fn forward(&self, tunnel: &dyn UpstreamTunnel, packet: &Bytes) -> Result<(), SessionError> {
        tunnel
            .write(packet)
            .await
            .map_err(|e| SessionError::forward("client->upstream", e.to_string()))?;

        self.stats.packets_up.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_up
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        trace!("UDP {} -> upstream ({} bytes)", self.key, packet.len());
        Ok(())
    }

    async fn read_upstream(
        self: Arc<Self>,
        tunnel: Arc<dyn UpstreamTunnel>,
        replies: Arc<dyn ReplyWriter>,
        buffer_size: usize,
    ) {
        let mut buf = vec![0u8; buffer_size];

        loop {
            let deadline = tokio::time::Instant::now() + self.read_timeout;
            tunnel.set_read_deadline(deadline);

            let result = tokio::time::timeout_at(deadline, tunnel.read(&mut buf))
                .await
                .unwrap_or(Err(TunnelError::DeadlineExceeded));

            match result {
                Ok(0) => {
                    debug!("UDP session {}: upstream finished", self.key);
                    break;
                }
                Ok(n) => {
                    self.stats.packets_down.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_down.fetch_add(n as u64, Ordering::Relaxed);

                    if let Err(e) = replies
                        .send_reply(&buf[..n], self.key.local, self.key.remote)
                        .await
                    {
                        warn!("UDP session {}: reply dropped: {}", self.key, e);
                    }

                    if self.class.is_single_shot() {
                        break;
                    }
                }
                Err(TunnelError::DeadlineExceeded) => {
                    debug!(
                        "UDP session {}: no upstream data for {:?}",
                        self.key, self.read_timeout
                    );
                    break;
                }
                Err(e) => {
                    if !self.is_closed() {
                        debug!(
                            "UDP session {}: {}",
                            self.key,
                            SessionError::forward("upstream->client", e.to_string())
                        );
                    }
                    break;
                }
            }
        }

        self.close().await;
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("key", &self.key)
            .field("class", &self.class)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Hand one intercepted datagram to its session, creating and starting the
/// session if the key is new.
///
/// A datagram that lands on a session in the middle of closing is retried
/// once against a fresh session.
pub fn dispatch_datagram(
    table: &Arc<UdpSessionTable>,
    ctx: &SessionContext,
    key: SessionKey,
    data: Bytes,
) -> EnqueueResult {
    let mut result = EnqueueResult::Closed;
    for _ in 0..2 {
        let (session, created) =
            table.get_or_create(key, || UdpSession::new(key, &ctx.config, table));
        if created {
            debug!("New UDP session {} ({})", key, session.class());
            session.start(ctx.clone());
        }

        result = session.enqueue(data.clone());
        if result != EnqueueResult::Closed {
            return result;
        }
        table.remove_if(&key, |s| Arc::ptr_eq(s, &session));
    }
    result
}
