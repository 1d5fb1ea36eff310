//! Proxy-wide counters
//!
//! Counters are plain relaxed atomics: packet counts only ever grow, the
//! origin/connection counts are gauges moved by open/close events.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic proxy statistics
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted_packets: AtomicU64,
    rejected_packets: AtomicU64,
    num_tcp_origins: AtomicU64,
    num_tcp_conns: AtomicU64,
    num_udp_conns: AtomicU64,
}

impl ProxyStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn packet_accepted(&self) {
        self.accepted_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn packet_rejected(&self) {
        self.rejected_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_origin_opened(&self) {
        self.num_tcp_origins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_origin_closed(&self) {
        self.num_tcp_origins.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_conn_opened(&self) {
        self.num_tcp_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_conn_closed(&self) {
        self.num_tcp_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_conn_opened(&self) {
        self.num_udp_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_conn_closed(&self) {
        self.num_udp_conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count of packets accepted by the demultiplexer
    #[must_use]
    pub fn accepted_packets(&self) -> u64 {
        self.accepted_packets.load(Ordering::Relaxed)
    }

    /// Count of packets rejected as malformed or unknown-protocol
    #[must_use]
    pub fn rejected_packets(&self) -> u64 {
        self.rejected_packets.load(Ordering::Relaxed)
    }

    /// Number of TCP origins being tracked
    #[must_use]
    pub fn num_tcp_origins(&self) -> u64 {
        self.num_tcp_origins.load(Ordering::Relaxed)
    }

    /// Number of TCP connections being tracked
    #[must_use]
    pub fn num_tcp_conns(&self) -> u64 {
        self.num_tcp_conns.load(Ordering::Relaxed)
    }

    /// Number of UDP flows being tracked
    #[must_use]
    pub fn num_udp_conns(&self) -> u64 {
        self.num_udp_conns.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            accepted_packets: self.accepted_packets(),
            rejected_packets: self.rejected_packets(),
            num_tcp_origins: self.num_tcp_origins(),
            num_tcp_conns: self.num_tcp_conns(),
            num_udp_conns: self.num_udp_conns(),
        }
    }
}

/// Snapshot of proxy statistics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    /// Packets accepted by the demultiplexer
    pub accepted_packets: u64,
    /// Packets rejected as malformed or unknown-protocol
    pub rejected_packets: u64,
    /// TCP origins being tracked
    pub num_tcp_origins: u64,
    /// TCP connections being tracked
    pub num_tcp_conns: u64,
    /// UDP flows being tracked
    pub num_udp_conns: u64,
}
