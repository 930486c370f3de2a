//! Test doubles for the tunnel, selector and reply seams

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use tproxy_tunnel::error::{ReplyWriteError, TunnelError};
use tproxy_tunnel::session::{Endpoint, SessionConfig, SessionContext};
use tproxy_tunnel::tproxy::ReplyWriter;
use tproxy_tunnel::tunnel::{ChannelSelector, ProtocolClass, TunnelProvider, UpstreamTunnel};

// ============================================================================
// Mock Tunnel
// ============================================================================

/// In-memory tunnel: records connects and writes, serves scripted responses
pub struct MockTunnel {
    channel: String,
    fail_connect: bool,
    connects: Mutex<Vec<(String, String)>>,
    writes: Mutex<Vec<Vec<u8>>>,
    responses_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    responses_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    deadline: Mutex<Option<Instant>>,
    deadline_sets: AtomicUsize,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    close_notify: Notify,
}

impl MockTunnel {
    fn new(channel: &str, fail_connect: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            channel: channel.to_string(),
            fail_connect,
            connects: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            responses_tx: Mutex::new(Some(tx)),
            responses_rx: tokio::sync::Mutex::new(rx),
            deadline: Mutex::new(None),
            deadline_sets: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            close_notify: Notify::new(),
        }
    }

    /// Queue one upstream response
    pub fn respond(&self, data: &[u8]) {
        if let Some(tx) = self.responses_tx.lock().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Make reads return EOF once queued responses are drained
    pub fn finish(&self) {
        self.responses_tx.lock().take();
    }

    pub fn connects(&self) -> Vec<(String, String)> {
        self.connects.lock().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn deadline_sets(&self) -> usize {
        self.deadline_sets.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamTunnel for MockTunnel {
    async fn connect(&self, protocol: &str, target: &str) -> Result<(), TunnelError> {
        self.connects
            .lock()
            .push((protocol.to_string(), target.to_string()));
        if self.fail_connect {
            return Err(TunnelError::connect_failed(target, "refused by mock"));
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.writes.lock().push(data.to_vec());
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let deadline = *self.deadline.lock();
        let mut rx = self.responses_rx.lock().await;

        let next = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.recv())
                    .await
                    .map_err(|_| TunnelError::DeadlineExceeded),
                None => Ok(rx.recv().await),
            }
        };

        tokio::select! {
            biased;
            () = notified => Err(TunnelError::Closed),
            next = next => match next? {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => Ok(0),
            },
        }
    }

    fn set_read_deadline(&self, deadline: Instant) {
        self.deadline_sets.fetch_add(1, Ordering::SeqCst);
        *self.deadline.lock() = Some(deadline);
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

// ============================================================================
// Mock Provider and Selector
// ============================================================================

/// Opens [`MockTunnel`]s and keeps every one it opened
#[derive(Default)]
pub struct MockTunnelProvider {
    fail_connect: bool,
    tunnels: Mutex<Vec<Arc<MockTunnel>>>,
}

impl MockTunnelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose tunnels refuse every connect
    pub fn refusing() -> Self {
        Self {
            fail_connect: true,
            tunnels: Mutex::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Wait for the `index`-th tunnel to be opened
    pub async fn tunnel(&self, index: usize) -> Arc<MockTunnel> {
        let found = wait_for(|| self.tunnels.lock().get(index).cloned()).await;
        found.unwrap_or_else(|| panic!("tunnel {index} was never opened"))
    }
}

#[async_trait]
impl TunnelProvider for MockTunnelProvider {
    async fn open_tunnel(&self, channel: &str) -> Result<Arc<dyn UpstreamTunnel>, TunnelError> {
        if channel != "mock" {
            return Err(TunnelError::ChannelNotFound(channel.to_string()));
        }
        let tunnel = Arc::new(MockTunnel::new(channel, self.fail_connect));
        self.tunnels.lock().push(Arc::clone(&tunnel));
        Ok(tunnel)
    }
}

/// Routes everything to one channel, or nowhere
pub struct FixedSelector(pub Option<&'static str>);

impl ChannelSelector for FixedSelector {
    fn select_channel(&self, _class: ProtocolClass, _host: &str) -> Option<String> {
        self.0.map(String::from)
    }
}

// ============================================================================
// Recording Reply Writer
// ============================================================================

/// A reply captured by [`RecordingReplyWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub data: Vec<u8>,
    pub local: Endpoint,
    pub remote: Endpoint,
}

pub struct RecordingReplyWriter {
    tx: mpsc::UnboundedSender<Reply>,
}

impl RecordingReplyWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReplyWriter for RecordingReplyWriter {
    async fn send_reply(
        &self,
        data: &[u8],
        local: Endpoint,
        remote: Endpoint,
    ) -> Result<usize, ReplyWriteError> {
        let _ = self.tx.send(Reply {
            data: data.to_vec(),
            local,
            remote,
        });
        Ok(data.len())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn ep(s: &str) -> Endpoint {
    s.parse::<SocketAddr>().unwrap().into()
}

pub fn session_config(udp_timeout: Duration, dns_timeout: Duration) -> SessionConfig {
    SessionConfig {
        udp_read_timeout: udp_timeout,
        dns_read_timeout: dns_timeout,
        queue_capacity: 64,
        reply_buffer_size: 2048,
    }
}

/// Context wired to a mock provider and a recording reply writer
pub fn mock_context(
    selector: FixedSelector,
    provider: &Arc<MockTunnelProvider>,
    config: SessionConfig,
) -> (SessionContext, mpsc::UnboundedReceiver<Reply>) {
    let (writer, replies) = RecordingReplyWriter::new();
    let ctx = SessionContext {
        selector: Arc::new(selector),
        tunnels: Arc::clone(provider) as Arc<dyn TunnelProvider>,
        replies: Arc::new(writer),
        config,
    };
    (ctx, replies)
}

/// Poll `probe` until it yields a value or two seconds pass
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let held = wait_for(|| condition().then_some(())).await;
    assert!(held.is_some(), "timed out waiting for {what}");
}

/// Await `fut` for at most two seconds
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}
