//! Userspace network stack interface
//!
//! The proxy terminates downstream TCP/UDP flows inside a userspace TCP/IP
//! stack, but the core never depends on a specific stack implementation.
//! This module is the seam: a small trait surface over which origins inject
//! inbound packets, receive outbound packets, and drive transport endpoints.
//!
//! # Architecture
//!
//! ```text
//! +--------------+   inject    +-----------------+   out channel   +---------+
//! | demultiplexer| ----------> |   NetStack      | --------------> | fan-in  |
//! +--------------+             | (per origin)    |  PacketInfo     +---------+
//!                              |                 |
//!                              | TransportEndpoint: bind / listen /
//!                              | accept / connect / read / write / close
//!                              +-----------------+
//!                                      |
//!                                wakes WaitQueue -> Notifier
//! ```
//!
//! Endpoints use non-blocking semantics: any operation that cannot make
//! progress returns [`StackError::WouldBlock`], and the stack pokes the
//! endpoint's [`WaitQueue`] when progress becomes possible. The notifier is
//! a single-slot, edge-triggered wake-up; coalescing dropped notifications
//! is correct because the woken task re-attempts the operation anyway.
//!
//! The default provider is backed by smoltcp (see [`smoltcp_stack`]).

pub mod device;
pub mod smoltcp_stack;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Notify;

pub use smoltcp_stack::{smoltcp_provider, SmoltcpStack};

/// Errors produced by stack and endpoint operations
#[derive(Error, Debug)]
pub enum StackError {
    /// The operation cannot make progress right now; wait on the notifier
    /// (reads) or back off and retry (writes)
    #[error("operation would block")]
    WouldBlock,

    /// The endpoint will never deliver more data; normal termination of the
    /// read direction
    #[error("endpoint is closed for receive")]
    ClosedForReceive,

    /// The endpoint is fully closed
    #[error("endpoint is closed")]
    Closed,

    /// Creating the NIC on the stack failed
    #[error("NIC creation failed: {0}")]
    NicCreate(String),

    /// Assigning a local address to the NIC failed
    #[error("address assignment failed: {0}")]
    AddressAssign(String),

    /// Creating a transport endpoint failed
    #[error("endpoint creation failed: {0}")]
    EndpointCreate(String),

    /// Binding the endpoint to its local address failed
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Putting the endpoint into the listen state failed
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// Associating the endpoint with a remote peer failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An endpoint write failed for a reason other than back-pressure
    #[error("send failed: {0}")]
    SendFailed(String),

    /// An endpoint read failed for a reason other than back-pressure
    #[error("receive failed: {0}")]
    RecvFailed(String),

    /// The operation is not supported by this endpoint kind
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl StackError {
    /// Whether this is the retryable back-pressure signal
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Whether this is the silent end-of-read signal
    #[must_use]
    pub fn is_closed_for_receive(&self) -> bool {
        matches!(self, Self::ClosedForReceive)
    }
}

/// Transport protocols an origin can terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Stream endpoint: listen + accept per downstream flow
    Tcp,
    /// Datagram endpoint: one per four-tuple
    Udp,
}

/// One outbound packet emitted by a stack's link endpoint
///
/// The downstream fan-in concatenates `header` and `data` into a single
/// contiguous IP packet before writing it to the carrier.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    /// Network and transport headers
    pub header: Bytes,
    /// Payload bytes
    pub data: Bytes,
}

impl PacketInfo {
    /// Total serialized length of the packet
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.len() + self.data.len()
    }

    /// Whether the packet carries no bytes at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.data.is_empty()
    }
}

/// Edge-triggered, single-slot wake-up signal
///
/// The stack wakes it when a registered endpoint may make progress; the
/// pump waits on it when an operation returned `WouldBlock`. At most one
/// wake-up is buffered; further wakes coalesce.
#[derive(Debug, Default)]
pub struct Notifier {
    inner: Notify,
}

impl Notifier {
    /// Create a new notifier with no pending wake-up
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a wake-up; coalesces with any already-pending one
    pub fn wake(&self) {
        self.inner.notify_one();
    }

    /// Wait for the next wake-up (or consume a pending one)
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

/// Registration point for readable-interest notifiers
///
/// Each endpoint gets a wait queue; the stack wakes every registered
/// notifier when the endpoint becomes readable (or acceptable, for
/// listeners). Unregistration is by identity.
#[derive(Debug, Default)]
pub struct WaitQueue {
    notifiers: Mutex<Vec<Arc<Notifier>>>,
}

impl WaitQueue {
    /// Create an empty wait queue
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a notifier for readable events
    pub fn register(&self, notifier: Arc<Notifier>) {
        self.notifiers.lock().push(notifier);
    }

    /// Remove a previously registered notifier
    pub fn unregister(&self, notifier: &Arc<Notifier>) {
        self.notifiers
            .lock()
            .retain(|n| !Arc::ptr_eq(n, notifier));
    }

    /// Wake every registered notifier
    pub fn wake_readable(&self) {
        for n in self.notifiers.lock().iter() {
            n.wake();
        }
    }

    /// Number of registered notifiers
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifiers.lock().len()
    }

    /// Whether no notifier is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifiers.lock().is_empty()
    }
}

/// A TCP or UDP endpoint inside a userspace stack
///
/// All operations are non-blocking; `WouldBlock` means "wait on the wait
/// queue and retry" for reads/accepts and "back off and retry" for writes.
pub trait TransportEndpoint: Send + Sync {
    /// Bind to a local address on the stack
    ///
    /// # Errors
    ///
    /// Returns [`StackError::BindFailed`] if the address cannot be bound.
    fn bind(&self, addr: SocketAddr) -> Result<(), StackError>;

    /// Enter the listen state with the given backlog (TCP listeners only)
    ///
    /// # Errors
    ///
    /// Returns [`StackError::ListenFailed`] on failure, or
    /// [`StackError::Unsupported`] for non-listening endpoint kinds.
    fn listen(&self, backlog: usize) -> Result<(), StackError>;

    /// Accept one established downstream connection (TCP listeners only)
    ///
    /// # Errors
    ///
    /// Returns [`StackError::WouldBlock`] when no connection is pending;
    /// wait on this endpoint's wait queue and retry.
    fn accept(&self) -> Result<(Arc<dyn TransportEndpoint>, Arc<WaitQueue>), StackError>;

    /// Associate the endpoint with a fixed remote peer (UDP only)
    ///
    /// Subsequent `write` calls send to that peer.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Unsupported`] for endpoint kinds without a
    /// connect operation.
    fn connect(&self, remote: SocketAddr) -> Result<(), StackError>;

    /// Read available payload bytes
    ///
    /// For UDP endpoints the second element is the datagram's sender.
    ///
    /// # Errors
    ///
    /// [`StackError::WouldBlock`] when nothing is readable;
    /// [`StackError::ClosedForReceive`] when the peer will send no more.
    fn read(&self) -> Result<(Vec<u8>, Option<SocketAddr>), StackError>;

    /// Write payload bytes; may accept fewer than offered
    ///
    /// # Errors
    ///
    /// [`StackError::WouldBlock`] when the send buffer is full.
    fn write(&self, buf: &[u8]) -> Result<usize, StackError>;

    /// Close the endpoint; further reads drain then report closed
    fn close(&self);

    /// Remote address of an established connection, if any
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A userspace TCP/IP stack instance owned by one origin
pub trait NetStack: Send + Sync {
    /// Create the NIC backed by this stack's link endpoint
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NicCreate`] if the NIC cannot be created.
    fn create_nic(&self) -> Result<(), StackError>;

    /// Assign a local IPv4 address to the NIC
    ///
    /// # Errors
    ///
    /// Returns [`StackError::AddressAssign`] on failure.
    fn add_address(&self, ip: Ipv4Addr) -> Result<(), StackError>;

    /// Accept packets for any destination address (ICMP pass-through)
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NicCreate`] if the NIC is not configured.
    fn set_promiscuous(&self, enabled: bool) -> Result<(), StackError>;

    /// Create a transport endpoint whose readable events wake `wait_queue`
    ///
    /// # Errors
    ///
    /// Returns [`StackError::EndpointCreate`] on failure.
    fn new_endpoint(
        &self,
        proto: TransportProtocol,
        wait_queue: Arc<WaitQueue>,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError>;

    /// Inject one inbound IP packet; the stack takes ownership of the bytes
    fn inject(&self, packet: Vec<u8>);

    /// Shut the stack down; the outbound channel closes once drained
    fn close(&self);
}

/// Construction parameters for a stack instance
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    /// MTU of the link endpoint
    pub mtu: usize,
    /// Capacity of the outbound packet channel
    pub outbound_buffer_depth: usize,
}

/// A freshly constructed stack plus the receiving end of its link
/// endpoint's outbound channel
pub struct StackHandle {
    /// The stack instance
    pub stack: Arc<dyn NetStack>,
    /// Outbound packets emitted by the stack's link endpoint
    pub outbound: mpsc::Receiver<PacketInfo>,
}

/// Factory for stack instances; the proxy calls this once per origin
pub type StackProvider = Arc<dyn Fn(StackConfig) -> Result<StackHandle, StackError> + Send + Sync>;
