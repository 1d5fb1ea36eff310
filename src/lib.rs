//! rust-ipproxy: userspace IPv4 traffic proxy
//!
//! This crate proxies raw IP traffic read from a downstream byte-stream
//! carrier (typically a tun-style device): TCP and UDP flows terminate in
//! per-destination userspace TCP/IP stacks, each flow is bridged to a fresh
//! upstream connection dialed to the packet's real destination, and
//! response packets are written back to the carrier. ICMP passes through a
//! dedicated in-process stack that answers echo requests itself.
//!
//! # Architecture
//!
//! ```text
//! carrier → classifier → demux → origin stack → endpoint → pump → upstream
//! carrier ← fan-in ← origin link endpoint ← stack ← endpoint ← pump ←
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use rust_ipproxy::{Opts, Proxy};
//!
//! # async fn example(tun: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = Proxy::new(tun, Opts::default())?;
//!
//! // Blocks until the carrier closes or `close()` is called
//! proxy.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: options, defaults and dial/stack injection points
//! - [`error`]: error taxonomy
//! - [`flow`]: origins, connections and the bidirectional pump
//! - [`lifecycle`]: the three-phase close primitive
//! - [`packet`]: IPv4 packet classification
//! - [`proxy`]: the proxy root, demultiplexer, reaper and fan-in
//! - [`stack`]: the userspace network stack interface and its smoltcp
//!   backing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod flow;
pub mod lifecycle;
pub mod packet;
pub mod proxy;
pub mod stack;

// Re-export the public surface at the crate root
pub use config::{
    default_dial_tcp, default_dial_udp, BoxUpstream, DialFn, DialFuture, Opts, Upstream,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MTU, DEFAULT_OUTBOUND_BUFFER_DEPTH, DEFAULT_STATS_INTERVAL,
    DEFAULT_TCP_CONNECT_BACKLOG,
};
pub use error::{ProxyError, Result};
pub use flow::udp::UdpDatagramStream;
pub use packet::{Addr, FourTuple, IpPacket, PacketError};
pub use proxy::stats::{ProxyStats, ProxyStatsSnapshot};
pub use proxy::Proxy;
pub use stack::{
    smoltcp_provider, NetStack, Notifier, PacketInfo, SmoltcpStack, StackConfig, StackError,
    StackHandle, StackProvider, TransportEndpoint, TransportProtocol, WaitQueue,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
