//! Proxy configuration
//!
//! All options carry documented defaults; a zero value is normalized to the
//! default so a zeroed [`Opts`] behaves identically to `Opts::default()`.
//! The dial functions and the stack provider are injection points: tests
//! substitute in-memory echoes and scripted stacks, production uses the
//! defaults (`tokio` dialers and the smoltcp-backed stack).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

use crate::flow::udp::UdpDatagramStream;
use crate::stack::{smoltcp_provider, StackProvider};

/// Default MTU in bytes; matches the usual tun device configuration
pub const DEFAULT_MTU: usize = 1500;

/// Default capacity of each origin's outbound packet channel
pub const DEFAULT_OUTBOUND_BUFFER_DEPTH: usize = 10_000;

/// Default idle timeout before the reaper closes a connection or origin
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(65);

/// Default TCP listen backlog per destination
pub const DEFAULT_TCP_CONNECT_BACKLOG: usize = 10;

/// Default interval between stats log lines
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(15);

/// A bidirectional upstream byte stream
///
/// TCP upstreams are `tokio::net::TcpStream`; UDP upstreams are wrapped in
/// [`UdpDatagramStream`] so each read yields exactly one datagram. Tests use
/// `tokio::io::duplex` halves.
pub trait Upstream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Upstream for T {}

/// Boxed upstream handle returned by dial functions
pub type BoxUpstream = Box<dyn Upstream>;

/// Future returned by a dial function
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxUpstream>> + Send>>;

/// Dials one upstream connection to the given destination
pub type DialFn = Arc<dyn Fn(SocketAddr) -> DialFuture + Send + Sync>;

/// Proxy options
///
/// Every field has a default; zero values are normalized to the default
/// when the proxy is constructed.
#[derive(Clone)]
pub struct Opts {
    /// MTU in bytes. Carrier reads are sized to this; endpoint-bound
    /// buffers reserve 40 bytes of IP+TCP header room below it.
    pub mtu: usize,

    /// Number of outbound packets each origin's link endpoint buffers
    /// before dropping.
    pub outbound_buffer_depth: usize,

    /// How long a connection or origin may stay idle before the reaper
    /// closes it.
    pub idle_timeout: Duration,

    /// Listen backlog for each TCP destination.
    pub tcp_connect_backlog: usize,

    /// How often the stats task logs counter snapshots.
    pub stats_interval: Duration,

    /// Dialer for upstream TCP connections. Defaults to
    /// `tokio::net::TcpStream::connect`.
    pub dial_tcp: Option<DialFn>,

    /// Dialer for upstream UDP "connections". Defaults to an unbound
    /// `tokio::net::UdpSocket` connected to the destination. UDP flow
    /// creation awaits this on the demultiplexer task, so a dialer that can
    /// stall indefinitely stalls all new flows; keep it bounded.
    pub dial_udp: Option<DialFn>,

    /// Factory for userspace stack instances. Defaults to the
    /// smoltcp-backed provider.
    pub stack_provider: Option<StackProvider>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            outbound_buffer_depth: DEFAULT_OUTBOUND_BUFFER_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tcp_connect_backlog: DEFAULT_TCP_CONNECT_BACKLOG,
            stats_interval: DEFAULT_STATS_INTERVAL,
            dial_tcp: None,
            dial_udp: None,
            stack_provider: None,
        }
    }
}

impl Opts {
    /// Normalize zero values to defaults and fill in the default dialers
    /// and stack provider
    #[must_use]
    pub(crate) fn resolve(self) -> ResolvedOpts {
        ResolvedOpts {
            mtu: if self.mtu == 0 { DEFAULT_MTU } else { self.mtu },
            outbound_buffer_depth: if self.outbound_buffer_depth == 0 {
                DEFAULT_OUTBOUND_BUFFER_DEPTH
            } else {
                self.outbound_buffer_depth
            },
            idle_timeout: if self.idle_timeout.is_zero() {
                DEFAULT_IDLE_TIMEOUT
            } else {
                self.idle_timeout
            },
            tcp_connect_backlog: if self.tcp_connect_backlog == 0 {
                DEFAULT_TCP_CONNECT_BACKLOG
            } else {
                self.tcp_connect_backlog
            },
            stats_interval: if self.stats_interval.is_zero() {
                DEFAULT_STATS_INTERVAL
            } else {
                self.stats_interval
            },
            dial_tcp: self.dial_tcp.unwrap_or_else(default_dial_tcp),
            dial_udp: self.dial_udp.unwrap_or_else(default_dial_udp),
            stack_provider: self.stack_provider.unwrap_or_else(smoltcp_provider),
        }
    }
}

/// Options after default application; every field is concrete
#[derive(Clone)]
pub(crate) struct ResolvedOpts {
    pub mtu: usize,
    pub outbound_buffer_depth: usize,
    pub idle_timeout: Duration,
    pub tcp_connect_backlog: usize,
    pub stats_interval: Duration,
    pub dial_tcp: DialFn,
    pub dial_udp: DialFn,
    pub stack_provider: StackProvider,
}

/// The default TCP dialer: a plain `TcpStream::connect`
#[must_use]
pub fn default_dial_tcp() -> DialFn {
    Arc::new(|addr| {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxUpstream)
        })
    })
}

/// The default UDP dialer: bind an ephemeral socket and connect it to the
/// destination, wrapped so reads and writes carry whole datagrams
#[must_use]
pub fn default_dial_udp() -> DialFn {
    Arc::new(|addr| {
        Box::pin(async move {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(addr).await?;
            Ok(Box::new(UdpDatagramStream::new(socket)) as BoxUpstream)
        })
    })
}
