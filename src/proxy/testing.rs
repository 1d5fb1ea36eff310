//! Scripted stack implementation for unit tests
//!
//! Implements the stack interface with fully scriptable behavior: tests
//! queue endpoint reads and pending accepts, observe writes and injected
//! packets, and emit outbound packets into the origin's channel on demand.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::stack::{
    NetStack, PacketInfo, StackError, StackHandle, StackProvider, TransportEndpoint,
    TransportProtocol, WaitQueue,
};

/// Build a provider that records every stack it creates
pub(crate) fn scripted_provider() -> (StackProvider, Arc<Mutex<Vec<Arc<ScriptedStack>>>>) {
    let stacks: Arc<Mutex<Vec<Arc<ScriptedStack>>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&stacks);
    let provider: StackProvider = Arc::new(move |config| {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer_depth.max(1));
        let stack = Arc::new(ScriptedStack {
            outbound: outbound_tx,
            nic: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            addresses: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
        });
        record.lock().push(Arc::clone(&stack));
        Ok(StackHandle {
            stack,
            outbound: outbound_rx,
        })
    });
    (provider, stacks)
}

/// A stack whose endpoints do exactly what the test scripts
pub(crate) struct ScriptedStack {
    outbound: mpsc::Sender<PacketInfo>,
    nic: AtomicBool,
    promiscuous: AtomicBool,
    closed: AtomicBool,
    addresses: Mutex<Vec<Ipv4Addr>>,
    injected: Mutex<Vec<Vec<u8>>>,
    endpoints: Mutex<Vec<Arc<ScriptedEndpoint>>>,
}

impl ScriptedStack {
    pub(crate) fn nic_created(&self) -> bool {
        self.nic.load(Ordering::SeqCst)
    }

    pub(crate) fn is_promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn addresses(&self) -> Vec<Ipv4Addr> {
        self.addresses.lock().clone()
    }

    pub(crate) fn injected(&self) -> Vec<Vec<u8>> {
        self.injected.lock().clone()
    }

    pub(crate) fn endpoints(&self) -> Vec<Arc<ScriptedEndpoint>> {
        self.endpoints.lock().clone()
    }

    /// Emit one packet on the origin's outbound channel
    pub(crate) fn emit_outbound(&self, packet: PacketInfo) {
        let _ = self.outbound.try_send(packet);
    }

    /// A standalone endpoint that always reads `WouldBlock`
    pub(crate) fn idle_endpoint() -> Arc<dyn TransportEndpoint> {
        Arc::new(ScriptedEndpoint::detached())
    }
}

impl NetStack for ScriptedStack {
    fn create_nic(&self) -> Result<(), StackError> {
        if self.nic.swap(true, Ordering::SeqCst) {
            return Err(StackError::NicCreate("NIC already exists".to_string()));
        }
        Ok(())
    }

    fn add_address(&self, ip: Ipv4Addr) -> Result<(), StackError> {
        self.addresses.lock().push(ip);
        Ok(())
    }

    fn set_promiscuous(&self, enabled: bool) -> Result<(), StackError> {
        self.promiscuous.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn new_endpoint(
        &self,
        _proto: TransportProtocol,
        wait_queue: Arc<WaitQueue>,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        let endpoint = Arc::new(ScriptedEndpoint {
            wait_queue,
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            accepts: Mutex::new(VecDeque::new()),
            peer: Mutex::new(None),
            remote: Mutex::new(None),
            backlog: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.endpoints.lock().push(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    fn inject(&self, packet: Vec<u8>) {
        self.injected.lock().push(packet);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for endpoint in self.endpoints.lock().iter() {
            endpoint.wait_queue.wake_readable();
        }
    }
}

enum ScriptedRead {
    Data(Vec<u8>, Option<SocketAddr>),
    Closed,
}

/// Endpoint whose reads, writes and accepts are driven by the test
pub(crate) struct ScriptedEndpoint {
    wait_queue: Arc<WaitQueue>,
    reads: Mutex<VecDeque<ScriptedRead>>,
    writes: Mutex<Vec<Vec<u8>>>,
    accepts: Mutex<VecDeque<(Arc<ScriptedEndpoint>, Arc<WaitQueue>)>>,
    peer: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    backlog: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedEndpoint {
    fn detached() -> Self {
        Self {
            wait_queue: WaitQueue::new(),
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            accepts: Mutex::new(VecDeque::new()),
            peer: Mutex::new(None),
            remote: Mutex::new(None),
            backlog: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue one readable datagram/segment and wake the reader
    pub(crate) fn push_read(&self, data: Vec<u8>) {
        self.reads.lock().push_back(ScriptedRead::Data(data, None));
        self.wait_queue.wake_readable();
    }

    /// Queue end-of-read and wake the reader
    pub(crate) fn push_read_closed(&self) {
        self.reads.lock().push_back(ScriptedRead::Closed);
        self.wait_queue.wake_readable();
    }

    /// Queue one established downstream connection and wake the acceptor
    pub(crate) fn push_accept(&self, remote: SocketAddr) -> Arc<ScriptedEndpoint> {
        let child = Arc::new(Self::detached());
        *child.remote.lock() = Some(remote);
        let child_wq = Arc::clone(&child.wait_queue);
        self.accepts
            .lock()
            .push_back((Arc::clone(&child), child_wq));
        self.wait_queue.wake_readable();
        child
    }

    /// Everything written to this endpoint so far, concatenated
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes.lock().concat()
    }

    pub(crate) fn listen_backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub(crate) fn connected_peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

impl TransportEndpoint for ScriptedEndpoint {
    fn bind(&self, _addr: SocketAddr) -> Result<(), StackError> {
        Ok(())
    }

    fn listen(&self, backlog: usize) -> Result<(), StackError> {
        self.backlog.store(backlog, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self) -> Result<(Arc<dyn TransportEndpoint>, Arc<WaitQueue>), StackError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StackError::Closed);
        }
        match self.accepts.lock().pop_front() {
            Some((endpoint, wait_queue)) => Ok((endpoint, wait_queue)),
            None => Err(StackError::WouldBlock),
        }
    }

    fn connect(&self, remote: SocketAddr) -> Result<(), StackError> {
        *self.peer.lock() = Some(remote);
        Ok(())
    }

    fn read(&self) -> Result<(Vec<u8>, Option<SocketAddr>), StackError> {
        match self.reads.lock().pop_front() {
            Some(ScriptedRead::Data(data, sender)) => Ok((data, sender)),
            Some(ScriptedRead::Closed) => Err(StackError::ClosedForReceive),
            None => {
                if self.closed.load(Ordering::SeqCst) {
                    Err(StackError::ClosedForReceive)
                } else {
                    Err(StackError::WouldBlock)
                }
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, StackError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StackError::Closed);
        }
        self.writes.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wait_queue.wake_readable();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }
}
