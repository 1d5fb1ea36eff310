//! smoltcp-backed implementation of the stack interface
//!
//! One [`SmoltcpStack`] is one private TCP/IP stack: an `Interface` plus
//! `SocketSet` over a [`QueueDevice`](super::device::QueueDevice) link
//! endpoint, driven by a dedicated task. The driver polls the interface
//! whenever a packet is injected or an endpoint writes, sleeps according to
//! `poll_delay` otherwise, and wakes the wait queues of endpoints that
//! became readable or acceptable.
//!
//! # Listen emulation
//!
//! smoltcp has no listener-with-backlog: a TCP socket accepts exactly one
//! connection. `listen(backlog)` therefore seeds `backlog` sockets in the
//! LISTEN state on the bound address; `accept()` promotes a socket that has
//! completed its handshake into a standalone connection endpoint and
//! replaces it with a fresh listener, keeping the pool at backlog depth.
//!
//! # Locking
//!
//! `Interface` and `SocketSet` are not thread-safe; every touch goes
//! through one `parking_lot::Mutex` held only for the duration of the
//! operation, never across an await point.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{
    RecvError as TcpRecvError, SendError as TcpSendError, Socket as TcpSocket,
    SocketBuffer as TcpSocketBuffer, State as TcpState,
};
use smoltcp::socket::udp::{
    PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata,
    RecvError as UdpRecvError, SendError as UdpSendError, Socket as UdpSocket,
};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::device::{PacketQueues, QueueDevice};
use super::{
    NetStack, Notifier, PacketInfo, StackConfig, StackError, StackHandle, StackProvider,
    TransportEndpoint, TransportProtocol, WaitQueue,
};

/// TCP receive buffer per socket
const TCP_RX_BUFFER: usize = 65536;

/// TCP transmit buffer per socket
const TCP_TX_BUFFER: usize = 65536;

/// UDP receive buffer per socket
const UDP_RX_BUFFER: usize = 65536;

/// UDP transmit buffer per socket
const UDP_TX_BUFFER: usize = 65536;

/// UDP packet metadata slots per buffer direction
const UDP_PACKET_META: usize = 64;

/// Poll interval when smoltcp reports no pending timer
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The default stack provider: one smoltcp stack per origin
#[must_use]
pub fn smoltcp_provider() -> StackProvider {
    Arc::new(|config| {
        let (stack, outbound) = SmoltcpStack::spawn(config)?;
        Ok(StackHandle { stack, outbound })
    })
}

/// A smoltcp `Interface` + `SocketSet` behind the stack interface
pub struct SmoltcpStack {
    inner: Mutex<Inner>,
    queues: Arc<PacketQueues>,
    /// Pokes the driver task to poll now
    poke: Arc<Notifier>,
    close_tx: watch::Sender<bool>,
    /// Backing reference so endpoints minted through the trait can hold
    /// the stack alive
    self_ref: OnceLock<Weak<SmoltcpStack>>,
}

struct Inner {
    iface: Interface,
    device: QueueDevice,
    sockets: SocketSet<'static>,
    endpoints: HashMap<usize, EndpointEntry>,
    next_endpoint_id: usize,
    nic_created: bool,
}

struct EndpointEntry {
    kind: EndpointKind,
    wait_queue: Arc<WaitQueue>,
    closed: bool,
}

enum EndpointKind {
    TcpListener(ListenerState),
    TcpConn { handle: SocketHandle },
    Udp { handle: SocketHandle, peer: Option<IpEndpoint> },
}

struct ListenerState {
    local: Option<IpListenEndpoint>,
    handles: Vec<SocketHandle>,
}

impl SmoltcpStack {
    /// Construct a stack and spawn its driver task
    ///
    /// Returns the stack and the receiving end of the link endpoint's
    /// outbound channel.
    ///
    /// # Errors
    ///
    /// Currently infallible but kept fallible to match the provider
    /// signature across implementations.
    pub fn spawn(
        config: StackConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PacketInfo>), StackError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer_depth.max(1));
        let queues = PacketQueues::new(outbound_tx);
        let mut device = QueueDevice::new(Arc::clone(&queues), config.mtu);

        let mut iface = Interface::new(
            IfaceConfig::new(HardwareAddress::Ip),
            &mut device,
            stack_now(),
        );
        // Local addresses are /32, so every reply is off-subnet; the
        // placeholder gateway satisfies route lookup and is never resolved
        // on an IP-medium device.
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 1))
            .map_err(|e| StackError::NicCreate(format!("route table: {e:?}")))?;
        let sockets = SocketSet::new(Vec::new());

        let stack = Arc::new(Self {
            inner: Mutex::new(Inner {
                iface,
                device,
                sockets,
                endpoints: HashMap::new(),
                next_endpoint_id: 0,
                nic_created: false,
            }),
            queues,
            poke: Notifier::new(),
            close_tx: watch::channel(false).0,
            self_ref: OnceLock::new(),
        });
        let _ = stack.self_ref.set(Arc::downgrade(&stack));

        tokio::spawn(drive(Arc::clone(&stack)));

        Ok((stack, outbound_rx))
    }

    /// One poll pass: run the interface, wake readable endpoints, reap
    /// finished sockets, report the next timer delay
    fn poll_once(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let ts = stack_now();

        inner.iface.poll(ts, &mut inner.device, &mut inner.sockets);

        for entry in inner.endpoints.values_mut() {
            let readable = match &entry.kind {
                EndpointKind::TcpListener(ls) => {
                    let mut acceptable = false;
                    for &h in &ls.handles {
                        let socket = inner.sockets.get_mut::<TcpSocket>(h);
                        match socket.state() {
                            // A listener whose half-open connection was
                            // reset falls back to CLOSED; re-arm it.
                            TcpState::Closed if !entry.closed => {
                                if let Some(local) = ls.local {
                                    let _ = socket.listen(local);
                                }
                            }
                            TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {}
                            _ => acceptable = true,
                        }
                    }
                    acceptable
                }
                EndpointKind::TcpConn { handle } => {
                    let socket = inner.sockets.get::<TcpSocket>(*handle);
                    socket.can_recv() || !socket.may_recv()
                }
                EndpointKind::Udp { handle, .. } => {
                    inner.sockets.get::<UdpSocket>(*handle).can_recv()
                }
            };
            if readable {
                entry.wait_queue.wake_readable();
            }
        }

        reap_finished(inner);

        inner
            .iface
            .poll_delay(ts, &inner.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    fn wake_all(&self) {
        let inner = self.inner.lock();
        for entry in inner.endpoints.values() {
            entry.wait_queue.wake_readable();
        }
    }

    fn strong_ref(&self) -> Result<Arc<Self>, StackError> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| StackError::EndpointCreate("stack is shutting down".to_string()))
    }
}

fn register_endpoint(
    stack: Arc<SmoltcpStack>,
    inner: &mut Inner,
    kind: EndpointKind,
    wait_queue: Arc<WaitQueue>,
) -> Arc<SmoltcpEndpoint> {
    let id = inner.next_endpoint_id;
    inner.next_endpoint_id += 1;
    inner.endpoints.insert(
        id,
        EndpointEntry {
            kind,
            wait_queue,
            closed: false,
        },
    );
    Arc::new(SmoltcpEndpoint { stack, id })
}

/// Remove endpoint entries whose sockets have fully drained after a close
fn reap_finished(inner: &mut Inner) {
    let sockets = &mut inner.sockets;
    inner.endpoints.retain(|_, entry| {
        if !entry.closed {
            return true;
        }
        match &entry.kind {
            EndpointKind::TcpConn { handle } => {
                if sockets.get::<TcpSocket>(*handle).state() == TcpState::Closed {
                    sockets.remove(*handle);
                    false
                } else {
                    true
                }
            }
            EndpointKind::TcpListener(ls) => {
                for &h in &ls.handles {
                    sockets.remove(h);
                }
                false
            }
            EndpointKind::Udp { handle, .. } => {
                sockets.remove(*handle);
                false
            }
        }
    });
}

impl NetStack for SmoltcpStack {
    fn create_nic(&self) -> Result<(), StackError> {
        let mut inner = self.inner.lock();
        if inner.nic_created {
            return Err(StackError::NicCreate("NIC already exists".to_string()));
        }
        inner.nic_created = true;
        Ok(())
    }

    fn add_address(&self, ip: Ipv4Addr) -> Result<(), StackError> {
        let mut inner = self.inner.lock();
        if !inner.nic_created {
            return Err(StackError::AddressAssign("no NIC".to_string()));
        }
        let o = ip.octets();
        let cidr = IpCidr::new(IpAddress::Ipv4(Ipv4Address::new(o[0], o[1], o[2], o[3])), 32);
        let mut pushed = false;
        inner.iface.update_ip_addrs(|addrs| {
            pushed = addrs.push(cidr).is_ok();
        });
        if pushed {
            debug!("assigned {ip} to stack");
            Ok(())
        } else {
            Err(StackError::AddressAssign(format!(
                "address table full, cannot add {ip}"
            )))
        }
    }

    fn set_promiscuous(&self, enabled: bool) -> Result<(), StackError> {
        let mut inner = self.inner.lock();
        if !inner.nic_created {
            return Err(StackError::NicCreate("no NIC".to_string()));
        }
        inner.iface.set_any_ip(enabled);
        Ok(())
    }

    fn new_endpoint(
        &self,
        proto: TransportProtocol,
        wait_queue: Arc<WaitQueue>,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        let stack = self.strong_ref()?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let kind = match proto {
            TransportProtocol::Tcp => EndpointKind::TcpListener(ListenerState {
                local: None,
                handles: Vec::new(),
            }),
            TransportProtocol::Udp => {
                let socket = UdpSocket::new(
                    UdpPacketBuffer::new(
                        vec![UdpPacketMetadata::EMPTY; UDP_PACKET_META],
                        vec![0u8; UDP_RX_BUFFER],
                    ),
                    UdpPacketBuffer::new(
                        vec![UdpPacketMetadata::EMPTY; UDP_PACKET_META],
                        vec![0u8; UDP_TX_BUFFER],
                    ),
                );
                let handle = inner.sockets.add(socket);
                EndpointKind::Udp { handle, peer: None }
            }
        };
        Ok(register_endpoint(stack, inner, kind, wait_queue))
    }

    fn inject(&self, packet: Vec<u8>) {
        self.queues.push_rx(packet);
        self.poke.wake();
    }

    fn close(&self) {
        self.close_tx.send_replace(true);
        self.poke.wake();
    }
}

async fn drive(stack: Arc<SmoltcpStack>) {
    let mut close_rx = stack.close_tx.subscribe();
    loop {
        if *close_rx.borrow_and_update() {
            break;
        }
        let delay = stack.poll_once().unwrap_or(IDLE_POLL_INTERVAL);
        tokio::select! {
            _ = close_rx.changed() => {}
            _ = stack.poke.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
    trace!("stack driver exiting");
    stack.wake_all();
}

/// A TCP listener, TCP connection or UDP endpoint on a [`SmoltcpStack`]
pub struct SmoltcpEndpoint {
    stack: Arc<SmoltcpStack>,
    id: usize,
}

fn new_listen_socket(
    sockets: &mut SocketSet<'static>,
    local: IpListenEndpoint,
) -> Result<SocketHandle, StackError> {
    let mut socket = TcpSocket::new(
        TcpSocketBuffer::new(vec![0u8; TCP_RX_BUFFER]),
        TcpSocketBuffer::new(vec![0u8; TCP_TX_BUFFER]),
    );
    socket.set_nagle_enabled(false);
    socket
        .listen(local)
        .map_err(|e| StackError::ListenFailed(format!("{e:?}")))?;
    Ok(sockets.add(socket))
}

impl TransportEndpoint for SmoltcpEndpoint {
    fn bind(&self, addr: SocketAddr) -> Result<(), StackError> {
        let local = to_listen_endpoint(addr)?;
        let mut inner = self.stack.inner.lock();
        let entry = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::Closed)?;
        match &mut entry.kind {
            EndpointKind::TcpListener(ls) => {
                ls.local = Some(local);
                Ok(())
            }
            EndpointKind::Udp { handle, .. } => {
                let handle = *handle;
                inner
                    .sockets
                    .get_mut::<UdpSocket>(handle)
                    .bind(local)
                    .map_err(|e| StackError::BindFailed(format!("{e:?}")))
            }
            EndpointKind::TcpConn { .. } => {
                Err(StackError::Unsupported("bind on accepted connection"))
            }
        }
    }

    fn listen(&self, backlog: usize) -> Result<(), StackError> {
        let mut inner = self.stack.inner.lock();
        let inner = &mut *inner;
        let entry = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::Closed)?;
        let EndpointKind::TcpListener(ls) = &mut entry.kind else {
            return Err(StackError::Unsupported("listen on non-listener"));
        };
        let Some(local) = ls.local else {
            return Err(StackError::ListenFailed("endpoint is not bound".to_string()));
        };
        if !ls.handles.is_empty() {
            return Err(StackError::ListenFailed("already listening".to_string()));
        }
        for _ in 0..backlog.max(1) {
            let handle = new_listen_socket(&mut inner.sockets, local)?;
            ls.handles.push(handle);
        }
        self.stack.poke.wake();
        Ok(())
    }

    fn accept(&self) -> Result<(Arc<dyn TransportEndpoint>, Arc<WaitQueue>), StackError> {
        let mut inner = self.stack.inner.lock();
        let inner_ref = &mut *inner;
        let entry = inner_ref
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::Closed)?;
        if entry.closed {
            return Err(StackError::Closed);
        }
        let EndpointKind::TcpListener(ls) = &mut entry.kind else {
            return Err(StackError::Unsupported("accept on non-listener"));
        };
        let Some(local) = ls.local else {
            return Err(StackError::ListenFailed("endpoint is not bound".to_string()));
        };

        let ready = ls.handles.iter().position(|&h| {
            !matches!(
                inner_ref.sockets.get::<TcpSocket>(h).state(),
                TcpState::Listen | TcpState::SynSent | TcpState::SynReceived | TcpState::Closed
            )
        });
        let Some(index) = ready else {
            return Err(StackError::WouldBlock);
        };

        let handle = ls.handles.remove(index);
        // Keep the pool at backlog depth
        let replacement = new_listen_socket(&mut inner_ref.sockets, local)?;
        ls.handles.push(replacement);

        let wait_queue = WaitQueue::new();
        let endpoint = register_endpoint(
            Arc::clone(&self.stack),
            inner_ref,
            EndpointKind::TcpConn { handle },
            Arc::clone(&wait_queue),
        );
        Ok((endpoint, wait_queue))
    }

    fn connect(&self, remote: SocketAddr) -> Result<(), StackError> {
        let remote = to_endpoint(remote)?;
        let mut inner = self.stack.inner.lock();
        let entry = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::Closed)?;
        match &mut entry.kind {
            EndpointKind::Udp { peer, .. } => {
                *peer = Some(remote);
                Ok(())
            }
            _ => Err(StackError::Unsupported("connect on TCP endpoint")),
        }
    }

    fn read(&self) -> Result<(Vec<u8>, Option<SocketAddr>), StackError> {
        let mut inner = self.stack.inner.lock();
        let inner = &mut *inner;
        let entry = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::ClosedForReceive)?;
        match &entry.kind {
            EndpointKind::TcpConn { handle } => {
                let socket = inner.sockets.get_mut::<TcpSocket>(*handle);
                if socket.can_recv() {
                    let data = socket
                        .recv(|buf| {
                            let data = buf.to_vec();
                            (data.len(), data)
                        })
                        .map_err(|e| match e {
                            TcpRecvError::Finished | TcpRecvError::InvalidState => {
                                StackError::ClosedForReceive
                            }
                        })?;
                    // Freed receive window; let the stack advertise it
                    self.stack.poke.wake();
                    Ok((data, None))
                } else if !socket.may_recv() {
                    Err(StackError::ClosedForReceive)
                } else {
                    Err(StackError::WouldBlock)
                }
            }
            EndpointKind::Udp { handle, .. } => {
                let closed = entry.closed;
                let socket = inner.sockets.get_mut::<UdpSocket>(*handle);
                match socket.recv() {
                    Ok((data, meta)) => {
                        let data = data.to_vec();
                        let sender = from_endpoint(meta.endpoint);
                        self.stack.poke.wake();
                        Ok((data, sender))
                    }
                    Err(UdpRecvError::Exhausted) => {
                        if closed || !socket.is_open() {
                            Err(StackError::ClosedForReceive)
                        } else {
                            Err(StackError::WouldBlock)
                        }
                    }
                    Err(other) => Err(StackError::RecvFailed(format!("{other:?}"))),
                }
            }
            EndpointKind::TcpListener(_) => Err(StackError::Unsupported("read on listener")),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, StackError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.stack.inner.lock();
        let inner = &mut *inner;
        let entry = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(StackError::Closed)?;
        match &entry.kind {
            EndpointKind::TcpConn { handle } => {
                let socket = inner.sockets.get_mut::<TcpSocket>(*handle);
                if !socket.may_send() {
                    return Err(StackError::Closed);
                }
                match socket.send_slice(buf) {
                    Ok(0) => Err(StackError::WouldBlock),
                    Ok(n) => {
                        self.stack.poke.wake();
                        Ok(n)
                    }
                    Err(TcpSendError::InvalidState) => Err(StackError::Closed),
                }
            }
            EndpointKind::Udp { handle, peer } => {
                let Some(peer) = *peer else {
                    return Err(StackError::SendFailed("no connected peer".to_string()));
                };
                let socket = inner.sockets.get_mut::<UdpSocket>(*handle);
                match socket.send_slice(buf, peer) {
                    Ok(()) => {
                        self.stack.poke.wake();
                        Ok(buf.len())
                    }
                    Err(UdpSendError::BufferFull) => Err(StackError::WouldBlock),
                    Err(UdpSendError::Unaddressable) => {
                        Err(StackError::SendFailed("unaddressable peer".to_string()))
                    }
                }
            }
            EndpointKind::TcpListener(_) => Err(StackError::Unsupported("write on listener")),
        }
    }

    fn close(&self) {
        let mut inner = self.stack.inner.lock();
        let inner = &mut *inner;
        let Some(entry) = inner.endpoints.get_mut(&self.id) else {
            return;
        };
        entry.closed = true;
        match &entry.kind {
            EndpointKind::TcpConn { handle } => {
                inner.sockets.get_mut::<TcpSocket>(*handle).close();
            }
            EndpointKind::TcpListener(ls) => {
                for &h in &ls.handles {
                    inner.sockets.get_mut::<TcpSocket>(h).abort();
                }
            }
            EndpointKind::Udp { handle, .. } => {
                inner.sockets.get_mut::<UdpSocket>(*handle).close();
            }
        }
        entry.wait_queue.wake_readable();
        self.stack.poke.wake();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        let inner = self.stack.inner.lock();
        let entry = inner.endpoints.get(&self.id)?;
        match &entry.kind {
            EndpointKind::TcpConn { handle } => {
                let socket = inner.sockets.get::<TcpSocket>(*handle);
                socket.remote_endpoint().and_then(from_endpoint)
            }
            EndpointKind::Udp { peer, .. } => peer.and_then(from_endpoint),
            EndpointKind::TcpListener(_) => None,
        }
    }
}

/// Monotonic timestamp for smoltcp timers, relative to process start
fn stack_now() -> SmoltcpInstant {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    SmoltcpInstant::from_millis(start.elapsed().as_millis() as i64)
}

fn to_listen_endpoint(addr: SocketAddr) -> Result<IpListenEndpoint, StackError> {
    match addr {
        SocketAddr::V4(v4) => {
            let o = v4.ip().octets();
            Ok(IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(Ipv4Address::new(o[0], o[1], o[2], o[3]))),
                port: v4.port(),
            })
        }
        SocketAddr::V6(_) => Err(StackError::BindFailed("IPv6 is not supported".to_string())),
    }
}

fn to_endpoint(addr: SocketAddr) -> Result<IpEndpoint, StackError> {
    match addr {
        SocketAddr::V4(v4) => {
            let o = v4.ip().octets();
            Ok(IpEndpoint::new(
                IpAddress::Ipv4(Ipv4Address::new(o[0], o[1], o[2], o[3])),
                v4.port(),
            ))
        }
        SocketAddr::V6(_) => Err(StackError::ConnectFailed(
            "IPv6 is not supported".to_string(),
        )),
    }
}

#[allow(unreachable_patterns)]
fn from_endpoint(endpoint: IpEndpoint) -> Option<SocketAddr> {
    match endpoint.addr {
        IpAddress::Ipv4(v4) => Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(v4.0[0], v4.0[1], v4.0[2], v4.0[3]),
            endpoint.port,
        ))),
        _ => None,
    }
}
