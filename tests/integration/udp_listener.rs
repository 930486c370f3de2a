//! Transparent UDP listener on loopback
//!
//! Uses the unprivileged socket provider: the kernel still delivers the
//! original destination as ancillary data (the listener's own address), so
//! the full receive → decode → session → reply path runs without
//! `CAP_NET_ADMIN`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use tproxy_tunnel::session::{SessionContext, SessionKey, UdpSessionTable};
use tproxy_tunnel::tproxy::{
    TransparentReplyWriter, TransparentUdpListener, UnprivilegedSocketProvider,
};
use tproxy_tunnel::tunnel::TunnelProvider;

use super::mocks::{session_config, wait_until, within, FixedSelector, MockTunnelProvider};

fn loopback_context(provider: &Arc<MockTunnelProvider>) -> SessionContext {
    SessionContext {
        selector: Arc::new(FixedSelector(Some("mock"))),
        tunnels: Arc::clone(provider) as Arc<dyn TunnelProvider>,
        replies: Arc::new(TransparentReplyWriter::new(Arc::new(
            UnprivilegedSocketProvider::new(),
        ))),
        config: session_config(Duration::from_secs(5), Duration::from_secs(1)),
    }
}

#[tokio::test]
async fn test_listener_dispatches_and_replies_from_original_destination() {
    let sockets = UnprivilegedSocketProvider::new();
    let listener = Arc::new(TransparentUdpListener::bind("127.0.0.1:0", &sockets).unwrap());
    let listen_addr = listener.listen_addr();

    let tunnels = Arc::new(MockTunnelProvider::new());
    let table = Arc::new(UdpSessionTable::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let run = {
        let listener = Arc::clone(&listener);
        let table = Arc::clone(&table);
        let ctx = loopback_context(&tunnels);
        tokio::spawn(async move { listener.run(shutdown_rx, table, ctx).await })
    };

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", listen_addr).await.unwrap();

    let tunnel = tunnels.tunnel(0).await;
    wait_until("datagram forwarded", || tunnel.writes().len() == 1).await;
    assert_eq!(tunnel.writes(), vec![b"hello".to_vec()]);
    assert_eq!(
        tunnel.connects(),
        vec![("udp".to_string(), listen_addr.to_string())]
    );

    let key = SessionKey::new(client.local_addr().unwrap().into(), listen_addr.into());
    assert!(table.contains(&key));

    tunnel.respond(b"world");
    let mut buf = [0u8; 64];
    let (n, from) = within(client.recv_from(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"world");
    assert_eq!(from, listen_addr);

    let stats = listener.stats().snapshot();
    assert_eq!((stats.packets_received, stats.bytes_received), (1, 5));
    assert_eq!(stats.decode_errors, 0);

    shutdown_tx.send(()).unwrap();
    within(run).await.unwrap();

    table.get(&key).unwrap().close().await;
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_listener_keeps_one_session_per_client() {
    let sockets = UnprivilegedSocketProvider::new();
    let listener = Arc::new(TransparentUdpListener::bind("127.0.0.1:0", &sockets).unwrap());
    let listen_addr = listener.listen_addr();

    let tunnels = Arc::new(MockTunnelProvider::new());
    let table = Arc::new(UdpSessionTable::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let run = {
        let listener = Arc::clone(&listener);
        let table = Arc::clone(&table);
        let ctx = loopback_context(&tunnels);
        tokio::spawn(async move { listener.run(shutdown_rx, table, ctx).await })
    };

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        a.send_to(b"a", listen_addr).await.unwrap();
    }
    b.send_to(b"b", listen_addr).await.unwrap();

    wait_until("four datagrams received", || {
        listener.stats().snapshot().packets_received == 4
    })
    .await;
    wait_until("two sessions", || table.len() == 2).await;
    assert_eq!(tunnels.opened(), 2);

    shutdown_tx.send(()).unwrap();
    within(run).await.unwrap();

    for session in table.values() {
        session.close().await;
    }
}

#[tokio::test]
async fn test_bind_conflict_is_setup_error() {
    let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = holder.local_addr().unwrap();

    let sockets = UnprivilegedSocketProvider::new();
    let err = TransparentUdpListener::bind(&addr.to_string(), &sockets).unwrap_err();
    assert!(matches!(
        err,
        tproxy_tunnel::error::SetupError::BindError { .. }
    ));
}
