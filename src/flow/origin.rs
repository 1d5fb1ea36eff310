//! Per-destination origin container
//!
//! An origin owns one private userspace stack instance, the transport
//! endpoint bound to the destination address, the outbound drainer task
//! that forwards the stack's packets into the proxy-wide fan-in channel,
//! and (for TCP) the map of accepted client connections.
//!
//! Construction follows a fixed ritual: allocate the stack, create its NIC,
//! assign the destination IP, create and bind the endpoint, then start the
//! drainer. Finalization runs in the reverse-dependency order: stack first
//! (so endpoints stop producing), then the caller's map-removal finalizer,
//! then the endpoint itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ActivityTracker, Conn, Finalizer};
use crate::config::ResolvedOpts;
use crate::error::ProxyError;
use crate::lifecycle::{Lifecycle, WorkerGuard};
use crate::packet::Addr;
use crate::stack::{
    NetStack, Notifier, PacketInfo, StackConfig, StackError, TransportEndpoint,
    TransportProtocol, WaitQueue,
};

/// A per-destination container around one userspace stack instance
pub struct Origin {
    /// Unique instance id; lets map-removal finalizers tell this origin
    /// apart from a successor installed under the same key
    id: u64,
    addr: Addr,
    stack: Arc<dyn NetStack>,
    endpoint: Arc<dyn TransportEndpoint>,
    wait_queue: Arc<WaitQueue>,
    notifier: Arc<Notifier>,
    clients: Mutex<HashMap<SocketAddr, Arc<Conn>>>,
    activity: Arc<ActivityTracker>,
    lifecycle: Arc<Lifecycle>,
    finalizer: Mutex<Option<Finalizer>>,
    /// Map-removal callback installed by the owner after construction
    /// (it needs the origin's id, which does not exist yet when the
    /// constructor finalizer is built)
    removal: Mutex<Option<Finalizer>>,
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Origin")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl Origin {
    /// Build an origin for `addr` and start its outbound drainer
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::OriginSetup`] if any stack construction step
    /// fails; the origin is not installed and the triggering packet is
    /// dropped.
    pub(crate) fn new(
        addr: Addr,
        proto: TransportProtocol,
        opts: &ResolvedOpts,
        fan_in: mpsc::Sender<PacketInfo>,
        finalizer: Finalizer,
    ) -> Result<Arc<Self>, ProxyError> {
        let setup = |source: StackError| ProxyError::OriginSetup {
            addr: addr.to_string(),
            source,
        };

        let handle = (opts.stack_provider)(StackConfig {
            mtu: opts.mtu,
            outbound_buffer_depth: opts.outbound_buffer_depth,
        })
        .map_err(setup)?;
        let stack = handle.stack;

        let wait_queue = WaitQueue::new();
        let endpoint = match init_stack(&stack, addr, proto, &wait_queue) {
            Ok(endpoint) => endpoint,
            Err(source) => {
                // The stack spawned its driver at creation; shut it down
                // rather than stranding the task.
                stack.close();
                return Err(setup(source));
            }
        };

        let notifier = Notifier::new();
        wait_queue.register(Arc::clone(&notifier));

        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let origin = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            stack,
            endpoint,
            wait_queue,
            notifier,
            clients: Mutex::new(HashMap::new()),
            activity: ActivityTracker::new(),
            lifecycle: Lifecycle::new(),
            finalizer: Mutex::new(Some(finalizer)),
            removal: Mutex::new(None),
        });

        let guard = origin.lifecycle.worker_guard();
        tokio::spawn(drain_outbound(
            Arc::clone(&origin),
            handle.outbound,
            fan_in,
            guard,
        ));
        debug!("created {proto:?} origin for {addr}");
        Ok(origin)
    }

    /// The destination address this origin represents
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Unique id of this origin instance
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Feed one raw downstream packet into the stack
    pub(crate) fn inject(&self, raw: Vec<u8>) {
        self.stack.inject(raw);
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn TransportEndpoint> {
        &self.endpoint
    }

    pub(crate) fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.wait_queue
    }

    pub(crate) fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub(crate) fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub(crate) fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    /// Install the map-removal callback; runs once during finalization
    pub(crate) fn set_removal(&self, removal: Finalizer) {
        *self.removal.lock() = Some(removal);
    }

    pub(crate) fn add_client(&self, addr: SocketAddr, conn: Arc<Conn>) {
        self.clients.lock().insert(addr, conn);
    }

    pub(crate) fn remove_client(&self, addr: SocketAddr) {
        self.clients.lock().remove(&addr);
    }

    /// Number of live client connections
    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Copy of the client map for lock-free iteration
    pub(crate) fn snapshot_clients(&self) -> Vec<Arc<Conn>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Request close without waiting
    pub(crate) fn close_now(&self) {
        self.lifecycle.request_close();
        self.notifier.wake();
    }

    /// Close the origin and all of its client connections; idempotent
    pub(crate) async fn close(&self) {
        self.close_now();

        for client in self.snapshot_clients() {
            client.close().await;
        }

        if self.lifecycle.try_begin_finalize() {
            self.lifecycle.wait_ready_to_finalize().await;
            self.run_finalizer();
            self.lifecycle.mark_closed();
        } else {
            self.lifecycle.wait_closed().await;
        }
    }

    fn run_finalizer(&self) {
        self.stack.close();
        if let Some(removal) = self.removal.lock().take() {
            removal();
        }
        if let Some(finalizer) = self.finalizer.lock().take() {
            finalizer();
        }
        self.wait_queue.unregister(&self.notifier);
        self.endpoint.close();
        trace!("origin for {} finalized", self.addr);
    }
}

/// NIC, address and endpoint setup for a freshly provided stack
fn init_stack(
    stack: &Arc<dyn NetStack>,
    addr: Addr,
    proto: TransportProtocol,
    wait_queue: &Arc<WaitQueue>,
) -> Result<Arc<dyn TransportEndpoint>, StackError> {
    stack.create_nic()?;
    stack.add_address(addr.ip)?;
    let endpoint = stack.new_endpoint(proto, Arc::clone(wait_queue))?;
    endpoint.bind(addr.socket_addr())?;
    Ok(endpoint)
}

/// Forward the stack's outbound packets into the proxy fan-in channel
async fn drain_outbound(
    origin: Arc<Origin>,
    mut outbound: mpsc::Receiver<PacketInfo>,
    fan_in: mpsc::Sender<PacketInfo>,
    guard: WorkerGuard,
) {
    loop {
        let packet = tokio::select! {
            _ = origin.lifecycle.wait_close_requested() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        tokio::select! {
            _ = origin.lifecycle.wait_close_requested() => break,
            result = fan_in.send(packet) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
    drop(guard);
    trace!("outbound drainer for {} exiting", origin.addr);
}
