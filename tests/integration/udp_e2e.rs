//! UDP and ICMP end-to-end scenarios
//!
//! The harness injects raw datagrams the way a tun device would; the proxy
//! terminates them in its userspace stack, bridges to an in-memory echo
//! upstream, and the echoed datagram must come back on the carrier with
//! the four-tuple reversed.

use smoltcp::wire::{IpProtocol, Ipv4Packet, UdpPacket};

use rust_ipproxy::Opts;

use super::support::{echo_dial, udp_packet, v4, wait_for, Harness};

fn udp_opts() -> Opts {
    Opts {
        dial_udp: Some(echo_dial()),
        ..Opts::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_echo_round_trip() {
    let mut h = Harness::start(udp_opts());
    let client = (v4(192, 168, 1, 9), 5353);
    let server = (v4(10, 0, 0, 2), 7);

    h.send(&udp_packet(client, server, b"ping")).await;

    let reply = h.carrier.next_packet_for(7, 5353).await;
    let ip = Ipv4Packet::new_checked(reply.as_slice()).expect("ipv4");
    assert_eq!(ip.next_header(), IpProtocol::Udp);
    assert_eq!(ip.src_addr(), server.0);
    assert_eq!(ip.dst_addr(), client.0);
    let udp = UdpPacket::new_checked(ip.payload()).expect("udp");
    assert_eq!(udp.payload(), b"ping");

    assert_eq!(h.proxy.num_udp_conns(), 1);
    h.proxy.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_flow_reused_and_ordered() {
    let mut h = Harness::start(udp_opts());
    let client = (v4(192, 168, 1, 9), 40000);
    let server = (v4(10, 0, 0, 2), 7);

    h.send(&udp_packet(client, server, b"one")).await;
    let first = h.carrier.next_packet_for(7, 40000).await;
    let ip = Ipv4Packet::new_checked(first.as_slice()).expect("ipv4");
    assert_eq!(
        UdpPacket::new_checked(ip.payload()).expect("udp").payload(),
        b"one"
    );
    assert_eq!(h.proxy.num_udp_conns(), 1);

    // Second datagram on the same four-tuple reuses the origin
    h.send(&udp_packet(client, server, b"two")).await;
    let second = h.carrier.next_packet_for(7, 40000).await;
    let ip = Ipv4Packet::new_checked(second.as_slice()).expect("ipv4");
    assert_eq!(
        UdpPacket::new_checked(ip.payload()).expect("udp").payload(),
        b"two"
    );
    assert_eq!(h.proxy.num_udp_conns(), 1);

    h.proxy.close().await.expect("close");
    assert_eq!(h.proxy.num_udp_conns(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_icmp_echo_passes_through() {
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, Ipv4Repr};

    let mut h = Harness::start(Opts::default());
    let src = v4(192, 168, 1, 9);
    let dst = v4(8, 8, 8, 8);

    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident: 7,
        seq_no: 1,
        data: b"abcdefgh",
    };
    let ip_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };
    let mut request = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ip = Ipv4Packet::new_unchecked(&mut request);
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    let mut icmp = Icmpv4Packet::new_unchecked(ip.payload_mut());
    icmp_repr.emit(&mut icmp, &ChecksumCapabilities::default());

    h.send(&request).await;

    let reply = h.carrier.next_packet().await;
    let ip = Ipv4Packet::new_checked(reply.as_slice()).expect("ipv4");
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), dst);
    assert_eq!(ip.dst_addr(), src);

    // No dial happened: ICMP terminates inside the dedicated stack
    assert!(wait_for(|| h.proxy.accepted_packets() == 1).await);
    assert_eq!(h.proxy.num_udp_conns(), 0);
    assert_eq!(h.proxy.num_tcp_origins(), 0);

    h.proxy.close().await.expect("close");
}
