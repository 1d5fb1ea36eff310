//! Integration tests for the userspace IP proxy
//!
//! These tests run the whole proxy against an in-memory duplex carrier and
//! the real smoltcp-backed stack provider. The test harness plays the role
//! of the downstream client network stack: it crafts raw IPv4 packets
//! (including complete TCP handshakes) and parses the packets the proxy
//! writes back. Upstream dials are stubbed with in-memory echoes.
//!
//! # Test Organization
//!
//! - `support`: carrier framing, packet builders, echo dialers
//! - `tcp_e2e`: TCP echo round trips, multiple destinations, idle reaping
//! - `udp_e2e`: UDP and ICMP echo round trips, flow reuse
//! - `lifecycle_e2e`: dial failure, downstream EOF, double close

pub mod support;

pub mod lifecycle_e2e;
pub mod tcp_e2e;
pub mod udp_e2e;
