//! In-memory link endpoint for smoltcp stack instances
//!
//! Each origin's stack talks to the rest of the proxy through this device:
//! inbound packets are injected into a bounded queue the device hands to
//! smoltcp, and packets smoltcp transmits are split into `{header, data}`
//! pairs and pushed onto the origin's bounded outbound channel.
//!
//! ```text
//! demultiplexer --inject--> [rx queue] --> smoltcp Interface
//! smoltcp Interface --TxToken--> PacketInfo --> outbound mpsc --> fan-in
//! ```
//!
//! Both directions drop on overflow: the rx queue because a stalled stack
//! must not buffer unbounded carrier input, the outbound channel to match
//! the bounded-depth link endpoint the origins are specified against. Drops
//! are logged at trace level.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use tokio::sync::mpsc;
use tracing::trace;

use super::PacketInfo;

/// Maximum injected packets buffered ahead of the stack's poll loop
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Shared packet queues between a stack instance and its device
#[derive(Debug)]
pub(crate) struct PacketQueues {
    /// Packets injected by the demultiplexer, awaiting a stack poll
    rx: Mutex<VecDeque<Vec<u8>>>,
    /// Outbound channel toward the origin's drainer task
    outbound: mpsc::Sender<PacketInfo>,
}

impl PacketQueues {
    pub(crate) fn new(outbound: mpsc::Sender<PacketInfo>) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(VecDeque::new()),
            outbound,
        })
    }

    /// Queue one inbound packet; drops when the stack is not keeping up
    pub(crate) fn push_rx(&self, packet: Vec<u8>) -> bool {
        let mut queue = self.rx.lock();
        if queue.len() >= INBOUND_QUEUE_DEPTH {
            trace!("inbound queue full, dropping {} byte packet", packet.len());
            return false;
        }
        queue.push_back(packet);
        true
    }

    pub(crate) fn pop_rx(&self) -> Option<Vec<u8>> {
        self.rx.lock().pop_front()
    }

    /// Push one transmitted packet onto the outbound channel
    ///
    /// The packet is split at the IPv4 header boundary into a
    /// `{header, data}` pair. Channel overflow drops the packet.
    pub(crate) fn push_outbound(&self, packet: Vec<u8>) {
        let info = split_packet(packet);
        match self.outbound.try_send(info) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(info)) => {
                trace!("outbound channel full, dropping {} byte packet", info.len());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("outbound channel closed, dropping packet");
            }
        }
    }
}

/// Split a serialized IPv4 packet into header and payload parts
fn split_packet(packet: Vec<u8>) -> PacketInfo {
    let mut bytes = Bytes::from(packet);
    let header_len = bytes
        .first()
        .map(|b| usize::from(b & 0x0f) * 4)
        .unwrap_or(0);
    if header_len == 0 || header_len > bytes.len() {
        return PacketInfo {
            header: bytes,
            data: Bytes::new(),
        };
    }
    let header = bytes.split_to(header_len);
    PacketInfo {
        header,
        data: bytes,
    }
}

/// smoltcp `Device` over the shared in-memory queues
///
/// Operates at `Medium::Ip` (raw IP packets, no Ethernet framing) and asks
/// smoltcp to generate checksums on transmit; injected packets come from a
/// real client stack and are not re-verified here.
pub(crate) struct QueueDevice {
    queues: Arc<PacketQueues>,
    mtu: usize,
}

impl QueueDevice {
    pub(crate) fn new(queues: Arc<PacketQueues>, mtu: usize) -> Self {
        Self { queues, mtu }
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = QueueRxToken where Self: 'a;
    type TxToken<'a> = QueueTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: SmoltcpInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.queues.pop_rx().map(|packet| {
            (
                QueueRxToken { packet },
                QueueTxToken {
                    queues: &self.queues,
                },
            )
        })
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken {
            queues: &self.queues,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps
    }
}

pub(crate) struct QueueRxToken {
    packet: Vec<u8>,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.packet;
        f(&mut packet)
    }
}

pub(crate) struct QueueTxToken<'a> {
    queues: &'a Arc<PacketQueues>,
}

impl<'a> TxToken for QueueTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queues.push_outbound(buffer);
        result
    }
}
