//! TCP end-to-end scenarios
//!
//! The harness drives complete TCP handshakes against the proxy's
//! userspace listeners, so these tests cover the whole inbound path:
//! classifier, demux, origin creation, smoltcp handshake, accept, upstream
//! dial, both pump directions and the downstream fan-in.

use std::time::Duration;

use rust_ipproxy::Opts;

use super::support::{echo_dial, v4, wait_for, Harness, TcpClient};

fn tcp_opts() -> Opts {
    Opts {
        dial_tcp: Some(echo_dial()),
        ..Opts::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_echo_round_trip() {
    let mut h = Harness::start(tcp_opts());
    let mut client = TcpClient::new((v4(192, 168, 1, 9), 50000), (v4(10, 0, 0, 1), 9));

    client.handshake(&mut h).await;
    assert!(wait_for(|| h.proxy.num_tcp_conns() == 1).await);
    assert_eq!(h.proxy.num_tcp_origins(), 1);

    let data = client.data(b"hello");
    h.send(&data).await;
    let echoed = client.recv_payload(&mut h).await;
    assert_eq!(echoed, b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_multiple_segments_in_order() {
    let mut h = Harness::start(tcp_opts());
    let mut client = TcpClient::new((v4(192, 168, 1, 9), 50001), (v4(10, 0, 0, 1), 9));

    client.handshake(&mut h).await;

    let first = client.data(b"first ");
    h.send(&first).await;
    let second = client.data(b"second");
    h.send(&second).await;

    let mut echoed = Vec::new();
    while echoed.len() < 12 {
        echoed.extend(client.recv_payload(&mut h).await);
    }
    assert_eq!(echoed, b"first second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multiple_destinations_tracked_and_settled() {
    let mut h = Harness::start(tcp_opts());

    let destinations = [
        (v4(10, 0, 0, 1), 9u16),
        (v4(10, 0, 0, 2), 9u16),
        (v4(10, 0, 0, 3), 443u16),
    ];
    let mut clients = Vec::new();
    for (i, dst) in destinations.into_iter().enumerate() {
        let mut client = TcpClient::new((v4(192, 168, 1, 9), 51000 + i as u16), dst);
        client.handshake(&mut h).await;
        clients.push(client);
    }

    assert!(wait_for(|| h.proxy.num_tcp_conns() == 3).await);
    assert_eq!(h.proxy.num_tcp_origins(), 3);

    // Each flow still works independently
    for client in &mut clients {
        let data = client.data(b"probe");
        h.send(&data).await;
        assert_eq!(client.recv_payload(&mut h).await, b"probe");
    }

    h.proxy.close().await.expect("close");
    assert!(wait_for(|| {
        h.proxy.num_tcp_conns() == 0 && h.proxy.num_tcp_origins() == 0
    })
    .await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_tcp_conn_reaped() {
    let mut h = Harness::start(Opts {
        dial_tcp: Some(echo_dial()),
        idle_timeout: Duration::from_secs(1),
        ..Opts::default()
    });
    let mut client = TcpClient::new((v4(192, 168, 1, 9), 52000), (v4(10, 0, 0, 1), 9));

    client.handshake(&mut h).await;
    let data = client.data(b"hello");
    h.send(&data).await;
    assert_eq!(client.recv_payload(&mut h).await, b"hello");
    assert!(wait_for(|| h.proxy.num_tcp_conns() == 1).await);

    // Past the idle timeout plus a reap tick, the connection is gone;
    // one more tick later the empty destination goes too
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(wait_for(|| h.proxy.num_tcp_conns() == 0).await);
    assert!(wait_for(|| h.proxy.num_tcp_origins() == 0).await);

    h.proxy.close().await.expect("close");
}
