//! Failure and shutdown scenarios
//!
//! Covers the error-propagation rule (per-flow failures never terminate
//! the proxy, carrier EOF does) and close idempotence.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rust_ipproxy::{DialFn, Opts, ProxyError};

use super::support::{echo_dial, udp_packet, v4, wait_for, Harness, TcpClient};

fn refusing_dial(count: Arc<AtomicUsize>) -> DialFn {
    Arc::new(move |_addr| {
        count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        })
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_dial_failure_abandons_flow_only() {
    let dials = Arc::new(AtomicUsize::new(0));
    let mut h = Harness::start(Opts {
        dial_tcp: Some(refusing_dial(Arc::clone(&dials))),
        dial_udp: Some(echo_dial()),
        ..Opts::default()
    });

    // The handshake still completes inside the userspace stack; the flow
    // dies when the upstream dial fails at accept time
    let mut client = TcpClient::new((v4(192, 168, 1, 9), 53000), (v4(10, 0, 0, 1), 80));
    client.handshake(&mut h).await;

    assert!(wait_for(|| dials.load(Ordering::SeqCst) == 1).await);
    assert!(h.proxy.accepted_packets() > 0, "packets were valid");
    assert_eq!(h.proxy.num_tcp_conns(), 0, "no connection installed");

    // Other flows are unaffected: UDP still round-trips
    h.send(&udp_packet(
        (v4(192, 168, 1, 9), 5353),
        (v4(10, 0, 0, 2), 7),
        b"still alive",
    ))
    .await;
    let reply = h.carrier.next_packet_for(7, 5353).await;
    assert!(!reply.is_empty());

    h.proxy.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_downstream_eof_terminates_serve() {
    let h = Harness::start(Opts {
        dial_udp: Some(echo_dial()),
        ..Opts::default()
    });

    // Dropping the harness carrier ends the downstream byte stream
    drop(h.carrier_write);
    drop(h.carrier);

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), h.serve)
        .await
        .expect("serve returned")
        .expect("serve task");
    assert!(matches!(result, Err(ProxyError::DownstreamClosed)));

    // close() after termination is a no-op, twice over
    h.proxy.close().await.expect("close");
    h.proxy.close().await.expect("close again");
    assert_eq!(h.proxy.num_tcp_origins(), 0);
    assert_eq!(h.proxy.num_udp_conns(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_settles_live_flows() {
    let mut h = Harness::start(Opts {
        dial_udp: Some(echo_dial()),
        dial_tcp: Some(echo_dial()),
        ..Opts::default()
    });

    let mut client = TcpClient::new((v4(192, 168, 1, 9), 54000), (v4(10, 0, 0, 1), 9));
    client.handshake(&mut h).await;
    h.send(&udp_packet(
        (v4(192, 168, 1, 9), 5353),
        (v4(10, 0, 0, 2), 7),
        b"x",
    ))
    .await;
    assert!(wait_for(|| {
        h.proxy.num_tcp_conns() == 1 && h.proxy.num_udp_conns() == 1
    })
    .await);

    h.proxy.close().await.expect("close");
    h.proxy.close().await.expect("double close");

    assert_eq!(h.proxy.num_tcp_origins(), 0);
    assert_eq!(h.proxy.num_tcp_conns(), 0);
    assert_eq!(h.proxy.num_udp_conns(), 0);
}
