//! Shared harness pieces for the integration tests
//!
//! The harness owns the far end of the duplex carrier: it writes raw IPv4
//! packets the way a tun device would deliver them and re-frames the byte
//! stream the proxy writes back into whole packets (splitting on the IPv4
//! total-length field, since consecutive packets may coalesce into one
//! read).

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber, UdpPacket, UdpRepr,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use rust_ipproxy::{BoxUpstream, DialFn, Opts, Proxy};

/// Initialize test logging once; respects `RUST_LOG`
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A running proxy plus the harness side of the carrier
pub struct Harness {
    pub proxy: Arc<Proxy>,
    pub carrier_write: WriteHalf<DuplexStream>,
    pub carrier: CarrierReader,
    pub serve: tokio::task::JoinHandle<rust_ipproxy::Result<()>>,
}

impl Harness {
    /// Start a proxy over a fresh duplex carrier with the given options
    pub fn start(opts: Opts) -> Self {
        init_tracing();
        let (near, far) = tokio::io::duplex(1 << 20);
        let proxy = Arc::new(Proxy::new(near, opts).expect("proxy"));
        let serve = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.serve().await })
        };
        let (read_half, write_half) = tokio::io::split(far);
        Self {
            proxy,
            carrier_write: write_half,
            carrier: CarrierReader::new(read_half),
            serve,
        }
    }

    /// Write one raw packet onto the carrier
    ///
    /// The proxy expects one packet per carrier read; a short pause keeps
    /// back-to-back writes from coalescing into a single read.
    pub async fn send(&mut self, packet: &[u8]) {
        self.carrier_write
            .write_all(packet)
            .await
            .expect("carrier write");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Re-frames the proxy's downstream byte stream into whole IPv4 packets
pub struct CarrierReader {
    read_half: ReadHalf<DuplexStream>,
    buffer: Vec<u8>,
}

impl CarrierReader {
    pub fn new(read_half: ReadHalf<DuplexStream>) -> Self {
        Self {
            read_half,
            buffer: Vec::new(),
        }
    }

    /// Next whole packet from the carrier; panics after 5 s of silence
    pub async fn next_packet(&mut self) -> Vec<u8> {
        loop {
            if self.buffer.len() >= 20 {
                let total = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
                if total >= 20 && self.buffer.len() >= total {
                    let packet: Vec<u8> = self.buffer.drain(..total).collect();
                    return packet;
                }
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.read_half.read(&mut chunk))
                .await
                .expect("downstream packet within timeout")
                .expect("carrier read");
            assert!(n > 0, "carrier closed while waiting for a packet");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next packet whose TCP/UDP ports match the given flow
    pub async fn next_packet_for(&mut self, src_port: u16, dst_port: u16) -> Vec<u8> {
        loop {
            let packet = self.next_packet().await;
            let ip = Ipv4Packet::new_checked(packet.as_slice()).expect("ipv4");
            let ports = match ip.next_header() {
                IpProtocol::Tcp => {
                    let tcp = TcpPacket::new_checked(ip.payload()).expect("tcp");
                    Some((tcp.src_port(), tcp.dst_port()))
                }
                IpProtocol::Udp => {
                    let udp = UdpPacket::new_checked(ip.payload()).expect("udp");
                    Some((udp.src_port(), udp.dst_port()))
                }
                _ => None,
            };
            if ports == Some((src_port, dst_port)) {
                return packet;
            }
        }
    }
}

/// Dialer whose upstream echoes every byte back
pub fn echo_dial() -> DialFn {
    Arc::new(|_addr: SocketAddr| {
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(1 << 16);
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
            Ok(Box::new(near) as BoxUpstream)
        })
    })
}

pub fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Address {
    Ipv4Address::new(a, b, c, d)
}

/// Build a checksummed IPv4+UDP packet
pub fn udp_packet(src: (Ipv4Address, u16), dst: (Ipv4Address, u16), payload: &[u8]) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: src.1,
        dst_port: dst.1,
    };
    let ip_repr = Ipv4Repr {
        src_addr: src.0,
        dst_addr: dst.0,
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let mut buf = vec![0u8; ip_repr.buffer_len() + udp_repr.header_len() + payload.len()];
    let mut ip = Ipv4Packet::new_unchecked(&mut buf);
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &IpAddress::Ipv4(src.0),
        &IpAddress::Ipv4(dst.0),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    buf
}

/// Minimal TCP client state machine for driving the proxy's listeners
///
/// Tracks sequence numbers for one flow so tests can run a complete
/// handshake and exchange data segments.
pub struct TcpClient {
    pub src: (Ipv4Address, u16),
    pub dst: (Ipv4Address, u16),
    pub seq: u32,
    pub ack: Option<u32>,
}

impl TcpClient {
    pub fn new(src: (Ipv4Address, u16), dst: (Ipv4Address, u16)) -> Self {
        Self {
            src,
            dst,
            seq: 1000,
            ack: None,
        }
    }

    fn segment(&self, control: TcpControl, payload: &[u8]) -> Vec<u8> {
        let tcp_repr = TcpRepr {
            src_port: self.src.1,
            dst_port: self.dst.1,
            control,
            seq_number: TcpSeqNumber(self.seq as i32),
            ack_number: self.ack.map(|a| TcpSeqNumber(a as i32)),
            window_len: 65000,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            payload,
        };
        let ip_repr = Ipv4Repr {
            src_addr: self.src.0,
            dst_addr: self.dst.0,
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            hop_limit: 64,
        };
        let mut buf = vec![0u8; ip_repr.buffer_len() + tcp_repr.buffer_len()];
        let mut ip = Ipv4Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp_repr.emit(
            &mut tcp,
            &IpAddress::Ipv4(self.src.0),
            &IpAddress::Ipv4(self.dst.0),
            &ChecksumCapabilities::default(),
        );
        buf
    }

    pub fn syn(&self) -> Vec<u8> {
        self.segment(TcpControl::Syn, &[])
    }

    pub fn ack_packet(&self) -> Vec<u8> {
        self.segment(TcpControl::None, &[])
    }

    pub fn data(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = self.segment(TcpControl::None, payload);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        packet
    }

    /// Run the three-way handshake against the proxy
    pub async fn handshake(&mut self, harness: &mut Harness) {
        let syn = self.syn();
        harness.send(&syn).await;
        self.seq = self.seq.wrapping_add(1);

        let syn_ack = harness
            .carrier
            .next_packet_for(self.dst.1, self.src.1)
            .await;
        let ip = Ipv4Packet::new_checked(syn_ack.as_slice()).expect("ipv4");
        let tcp = TcpPacket::new_checked(ip.payload()).expect("tcp");
        assert!(tcp.syn() && tcp.ack(), "expected SYN-ACK");
        assert_eq!(tcp.ack_number().0 as u32, self.seq);
        self.ack = Some((tcp.seq_number().0 as u32).wrapping_add(1));

        let ack = self.ack_packet();
        harness.send(&ack).await;
    }

    /// Read downstream packets for this flow until one carries payload;
    /// acknowledges it and returns the bytes
    pub async fn recv_payload(&mut self, harness: &mut Harness) -> Vec<u8> {
        loop {
            let packet = harness
                .carrier
                .next_packet_for(self.dst.1, self.src.1)
                .await;
            let ip = Ipv4Packet::new_checked(packet.as_slice()).expect("ipv4");
            let tcp = TcpPacket::new_checked(ip.payload()).expect("tcp");
            let payload = tcp.payload().to_vec();
            if payload.is_empty() {
                continue;
            }
            let seq = tcp.seq_number().0 as u32;
            self.ack = Some(seq.wrapping_add(payload.len() as u32));
            let ack = self.ack_packet();
            harness.send(&ack).await;
            return payload;
        }
    }
}

/// Poll a condition with a bounded number of short sleeps
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
