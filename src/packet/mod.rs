//! Inbound packet classification
//!
//! Every frame read from the downstream carrier is parsed here into an
//! [`IpPacket`]: the IP protocol number, the four-tuple, and the raw bytes.
//! The raw bytes are kept intact because ownership moves into a userspace
//! stack instance when the packet is injected; the carrier never recycles
//! these buffers.
//!
//! Parsing uses `smoltcp::wire` header views. No reassembly is performed;
//! anything that does not parse as an IPv4 packet carrying TCP, UDP or ICMP
//! headers sized to the buffer is rejected by the caller.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use thiserror::Error;

/// IP protocol number for ICMP
pub const IP_PROTOCOL_ICMP: u8 = 1;

/// IP protocol number for TCP
pub const IP_PROTOCOL_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IP_PROTOCOL_UDP: u8 = 17;

/// Errors produced while classifying an inbound frame
#[derive(Error, Debug)]
pub enum PacketError {
    /// The frame is not a well-formed IPv4 packet
    #[error("malformed IPv4 packet: {0}")]
    MalformedIp(String),

    /// The IPv4 payload is not a well-formed transport header
    #[error("malformed {proto} header: {reason}")]
    MalformedTransport {
        /// Transport protocol name
        proto: &'static str,
        /// Parse failure detail
        reason: String,
    },
}

/// A destination or source address: IPv4 address plus port
///
/// Key for TCP destinations (destination side only) and one half of a
/// [`FourTuple`]. Equality and hashing are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// Port number
    pub port: u16,
}

impl Addr {
    /// Create a new address
    #[must_use]
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Convert to a `SocketAddr` for upstream dialing
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The four-tuple identifying one flow
///
/// Key for UDP flows. Equality and hashing are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    /// Downstream source (the client behind the carrier)
    pub src: Addr,
    /// Destination the client is talking to
    pub dst: Addr,
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A classified inbound IPv4 packet
///
/// Immutable after parse. `raw` stays valid until it is injected into a
/// stack instance, which takes ownership.
#[derive(Debug, Clone)]
pub struct IpPacket {
    /// IP protocol number (1 ICMP, 6 TCP, 17 UDP, anything else rejected)
    pub proto: u8,
    /// The packet's four-tuple; ports are zero for non-TCP/UDP protocols
    pub ft: FourTuple,
    /// The full raw packet as read from the carrier
    pub raw: Vec<u8>,
}

impl IpPacket {
    /// Parse a raw frame into a classified packet
    ///
    /// Extracts the protocol number, source/destination IPs and, for TCP and
    /// UDP, the ports. Protocols other than TCP/UDP get a four-tuple with
    /// zero ports; the demultiplexer decides what to do with them.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the frame is not a well-formed IPv4 packet
    /// or its TCP/UDP header is truncated.
    pub fn parse(raw: Vec<u8>) -> Result<Self, PacketError> {
        let ipv4 = Ipv4Packet::new_checked(raw.as_slice())
            .map_err(|e| PacketError::MalformedIp(format!("{e}")))?;
        if ipv4.version() != 4 {
            return Err(PacketError::MalformedIp(format!(
                "version {}",
                ipv4.version()
            )));
        }

        let src_ip = octets_to_ip(ipv4.src_addr().0);
        let dst_ip = octets_to_ip(ipv4.dst_addr().0);
        let proto = u8::from(ipv4.next_header());

        let (src_port, dst_port) = match ipv4.next_header() {
            IpProtocol::Tcp => {
                let tcp = TcpPacket::new_checked(ipv4.payload()).map_err(|e| {
                    PacketError::MalformedTransport {
                        proto: "TCP",
                        reason: format!("{e}"),
                    }
                })?;
                (tcp.src_port(), tcp.dst_port())
            }
            IpProtocol::Udp => {
                let udp = UdpPacket::new_checked(ipv4.payload()).map_err(|e| {
                    PacketError::MalformedTransport {
                        proto: "UDP",
                        reason: format!("{e}"),
                    }
                })?;
                (udp.src_port(), udp.dst_port())
            }
            _ => (0, 0),
        };

        Ok(Self {
            proto,
            ft: FourTuple {
                src: Addr::new(src_ip, src_port),
                dst: Addr::new(dst_ip, dst_port),
            },
            raw,
        })
    }
}

fn octets_to_ip(octets: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])
}
