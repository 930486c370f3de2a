//! UDP session lifecycle tests
//!
//! Drive sessions through `dispatch_datagram` against a mock tunnel and a
//! recording reply writer.
//!
//! # Test Categories
//!
//! 1. **DNS**: single-shot relay and teardown
//! 2. **Generic UDP**: continuous relay, idle timeout, ordering
//! 3. **Table semantics**: one session per key under concurrency
//! 4. **Failures**: no route, refused connect, upstream EOF

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use tproxy_tunnel::session::{
    dispatch_datagram, EnqueueResult, SessionKey, SessionState, UdpSessionTable,
};
use tproxy_tunnel::tunnel::ProtocolClass;

use super::mocks::{
    ep, mock_context, session_config, wait_until, within, FixedSelector, MockTunnelProvider,
};

fn long_timeouts() -> tproxy_tunnel::session::SessionConfig {
    session_config(Duration::from_secs(10), Duration::from_secs(10))
}

// ============================================================================
// DNS
// ============================================================================

#[tokio::test]
async fn test_dns_session_relays_one_reply_then_closes() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, mut replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());

    let client = ep("10.0.0.2:40000");
    let server = ep("203.0.113.5:53");
    let key = SessionKey::new(client, server);

    let result = dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"query"));
    assert_eq!(result, EnqueueResult::Queued);

    let session = table.get(&key).expect("session created");
    assert_eq!(session.class(), ProtocolClass::Dns);

    let tunnel = provider.tunnel(0).await;
    wait_until("query forwarded", || tunnel.writes().len() == 1).await;
    assert_eq!(
        tunnel.connects(),
        vec![("udp".to_string(), "203.0.113.5:53".to_string())]
    );
    assert_eq!(tunnel.writes(), vec![b"query".to_vec()]);

    tunnel.respond(b"answer");
    tunnel.respond(b"late answer");

    let reply = within(replies.recv()).await.expect("reply written");
    assert_eq!(reply.data, b"answer");
    assert_eq!(reply.local, client);
    assert_eq!(reply.remote, server);

    wait_until("session removed", || !table.contains(&key)).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(tunnel.is_closed());

    // Single-shot: the second upstream datagram is never relayed
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn test_dns_session_times_out_quickly() {
    let provider = Arc::new(MockTunnelProvider::new());
    let config = session_config(Duration::from_secs(10), Duration::from_millis(100));
    let (ctx, mut replies) = mock_context(FixedSelector(Some("mock")), &provider, config);
    let table = Arc::new(UdpSessionTable::new());

    let key = SessionKey::new(ep("10.0.0.2:40001"), ep("8.8.8.8:53"));
    let started = Instant::now();
    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"q"));

    wait_until("dns session timed out", || !table.contains(&key)).await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(provider.tunnel(0).await.is_closed());
    assert!(replies.try_recv().is_err());
}

// ============================================================================
// Generic UDP
// ============================================================================

#[tokio::test]
async fn test_generic_session_relays_until_idle() {
    let provider = Arc::new(MockTunnelProvider::new());
    let config = session_config(Duration::from_millis(200), Duration::from_secs(1));
    let (ctx, mut replies) = mock_context(FixedSelector(Some("mock")), &provider, config);
    let table = Arc::new(UdpSessionTable::new());

    let client = ep("10.0.0.2:50000");
    let server = ep("1.1.1.1:443");
    let key = SessionKey::new(client, server);

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"hello"));
    let tunnel = provider.tunnel(0).await;
    assert_eq!(table.get(&key).unwrap().class(), ProtocolClass::Udp);

    tunnel.respond(b"one");
    tunnel.respond(b"two");
    assert_eq!(within(replies.recv()).await.unwrap().data, b"one");
    assert_eq!(within(replies.recv()).await.unwrap().data, b"two");

    // Still forwarding after replies
    assert!(table.contains(&key));

    let idle_from = Instant::now();
    wait_until("idle session removed", || !table.contains(&key)).await;
    assert!(idle_from.elapsed() >= Duration::from_millis(100));
    assert!(tunnel.is_closed());

    // Deadline re-armed before every read: two data reads plus the one that expired
    assert!(tunnel.deadline_sets() >= 3);
}

#[tokio::test]
async fn test_datagrams_forwarded_in_order_one_write_each() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50001"), ep("198.51.100.7:3478"));

    let packets: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; usize::from(i) + 1]).collect();
    for packet in &packets {
        let result = dispatch_datagram(&table, &ctx, key, Bytes::from(packet.clone()));
        assert_eq!(result, EnqueueResult::Queued);
    }

    let tunnel = provider.tunnel(0).await;
    wait_until("all datagrams forwarded", || tunnel.writes().len() == packets.len()).await;
    assert_eq!(tunnel.writes(), packets);
    assert_eq!(provider.opened(), 1);

    let session = table.get(&key).unwrap();
    assert_eq!(session.state(), SessionState::Forwarding);
    session.close().await;
}

#[tokio::test]
async fn test_upstream_eof_closes_generic_session() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50002"), ep("1.1.1.1:443"));

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"x"));
    let tunnel = provider.tunnel(0).await;
    tunnel.finish();

    wait_until("session removed on EOF", || !table.contains(&key)).await;
    assert!(tunnel.is_closed());
}

// ============================================================================
// Table Semantics
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_packets_share_one_session() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50003"), ep("1.1.1.1:443"));

    let tasks: Vec<_> = (0..16u8)
        .map(|i| {
            let table = Arc::clone(&table);
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatch_datagram(&table, &ctx, key, Bytes::from(vec![i])) })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), EnqueueResult::Queued);
    }

    assert_eq!(table.stats_snapshot().created, 1);
    let tunnel = provider.tunnel(0).await;
    wait_until("all datagrams forwarded", || tunnel.writes().len() == 16).await;
    assert_eq!(provider.opened(), 1);

    table.get(&key).unwrap().close().await;
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_sessions() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, mut replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());

    let server = ep("1.1.1.1:443");
    let a = SessionKey::new(ep("10.0.0.2:1000"), server);
    let b = SessionKey::new(ep("10.0.0.3:1000"), server);

    dispatch_datagram(&table, &ctx, a, Bytes::from_static(b"a"));
    let first = provider.tunnel(0).await;
    dispatch_datagram(&table, &ctx, b, Bytes::from_static(b"b"));
    let second = provider.tunnel(1).await;

    assert_eq!(table.len(), 2);
    assert!(!Arc::ptr_eq(&table.get(&a).unwrap(), &table.get(&b).unwrap()));

    wait_until("both forwarded", || {
        first.writes().len() == 1 && second.writes().len() == 1
    })
    .await;
    assert_eq!(first.writes(), vec![b"a".to_vec()]);
    assert_eq!(second.writes(), vec![b"b".to_vec()]);

    second.respond(b"for b");
    let reply = within(replies.recv()).await.unwrap();
    assert_eq!(reply.local, b.local);

    for session in table.values() {
        session.close().await;
    }
    assert!(table.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_no_route_closes_without_tunnel() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(None), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50004"), ep("1.1.1.1:443"));

    let session = {
        dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"x"));
        table.get(&key)
    };

    wait_until("session removed", || !table.contains(&key)).await;
    assert_eq!(provider.opened(), 0);
    if let Some(session) = session {
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.snapshot().channel.is_none());
    }
}

#[tokio::test]
async fn test_refused_connect_closes_tunnel() {
    let provider = Arc::new(MockTunnelProvider::refusing());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50005"), ep("203.0.113.5:53"));

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"q"));
    let tunnel = provider.tunnel(0).await;

    wait_until("session removed", || !table.contains(&key)).await;
    assert!(tunnel.is_closed());
    assert_eq!(tunnel.connects().len(), 1);
    assert!(tunnel.writes().is_empty());
}

#[tokio::test]
async fn test_unknown_channel_closes_session() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("missing")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50006"), ep("1.1.1.1:443"));

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"x"));
    wait_until("session removed", || !table.contains(&key)).await;
    assert_eq!(provider.opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_upstream_open_closes_every_tunnel() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());

    let closers: Vec<_> = (0..64u16)
        .map(|port| {
            let key = SessionKey::new(ep(&format!("10.0.1.2:{}", 20000 + port)), ep("1.1.1.1:443"));
            dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"x"));
            let session = table.get(&key).unwrap();
            tokio::spawn(async move { session.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert!(table.is_empty());
    // Drivers that had not opened a tunnel yet may still open one and must close it
    tokio::time::sleep(Duration::from_millis(50)).await;
    for index in 0..provider.opened() {
        let tunnel = provider.tunnel(index).await;
        wait_until("raced tunnel closed", || tunnel.is_closed()).await;
    }
}

#[tokio::test]
async fn test_new_session_after_close() {
    let provider = Arc::new(MockTunnelProvider::new());
    let (ctx, _replies) = mock_context(FixedSelector(Some("mock")), &provider, long_timeouts());
    let table = Arc::new(UdpSessionTable::new());
    let key = SessionKey::new(ep("10.0.0.2:50007"), ep("1.1.1.1:443"));

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"1"));
    let first = provider.tunnel(0).await;
    table.get(&key).unwrap().close().await;
    assert!(first.is_closed());

    dispatch_datagram(&table, &ctx, key, Bytes::from_static(b"2"));
    let second = provider.tunnel(1).await;
    wait_until("second session forwarded", || second.writes().len() == 1).await;
    assert_eq!(table.stats_snapshot().created, 2);

    table.get(&key).unwrap().close().await;
}
