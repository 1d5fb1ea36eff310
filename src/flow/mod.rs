//! Per-flow state: origins, connections and the bidirectional pump
//!
//! A [`Conn`] bridges one userspace transport endpoint to one upstream
//! connection with two concurrent pump tasks:
//!
//! ```text
//! endpoint.read() --(notifier on WouldBlock)--> upstream write  (to upstream)
//! upstream read --(fresh mtu-40 buffer)--> endpoint.write()     (from upstream)
//! ```
//!
//! The endpoint-bound direction retries partial writes with a bounded
//! back-off (`min(attempt * 1ms, 30ms)`); the counter resets whenever the
//! endpoint accepts bytes, so a saturated send buffer costs at most 30 ms
//! per retry and never busy-spins.
//!
//! Each successful transfer updates the flow's activity timestamp, which
//! the reaper compares against the idle timeout.

pub mod origin;
pub mod tcp;
pub mod udp;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::config::BoxUpstream;
use crate::lifecycle::{Lifecycle, WorkerGuard};
use crate::stack::{Notifier, StackError, TransportEndpoint, WaitQueue};

/// Bytes reserved below the MTU for the IP and TCP headers the stack adds
/// to endpoint writes
pub(crate) const TCPIP_HEADER_BYTES: usize = 40;

/// Longest single back-off sleep in the endpoint write loop
pub(crate) const MAX_WRITE_WAIT: Duration = Duration::from_millis(30);

/// Callback run exactly once when a flow object finalizes
pub(crate) type Finalizer = Box<dyn FnOnce() + Send>;

/// Monotonic activity timestamp shared by a flow and the reaper
///
/// Stored as milliseconds since process start on the tokio clock, so tests
/// can drive idle expiry with `tokio::time::pause`.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_active_ms: AtomicU64,
}

impl ActivityTracker {
    /// Create a tracker marked active now
    #[must_use]
    pub fn new() -> Arc<Self> {
        let tracker = Arc::new(Self::default());
        tracker.mark_active();
        tracker
    }

    /// Record activity now
    pub fn mark_active(&self) {
        self.last_active_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded activity
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        let last = self.last_active_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }
}

fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// The pump state for a single flow
///
/// Owns the userspace endpoint side; the upstream halves move into the two
/// pump tasks when [`Conn::spawn_pumps`] runs. The finalizer (map removal,
/// counter update) runs exactly once, after both pumps have exited.
pub struct Conn {
    endpoint: Arc<dyn TransportEndpoint>,
    wait_queue: Arc<WaitQueue>,
    notifier: Arc<Notifier>,
    activity: Arc<ActivityTracker>,
    lifecycle: Arc<Lifecycle>,
    finalizer: Mutex<Option<Finalizer>>,
    mtu: usize,
}

impl Conn {
    /// Create a connection and register its readable notifier
    pub(crate) fn new(
        endpoint: Arc<dyn TransportEndpoint>,
        wait_queue: Arc<WaitQueue>,
        activity: Arc<ActivityTracker>,
        mtu: usize,
        finalizer: Finalizer,
    ) -> Arc<Self> {
        let notifier = Notifier::new();
        wait_queue.register(Arc::clone(&notifier));
        activity.mark_active();
        Arc::new(Self {
            endpoint,
            wait_queue,
            notifier,
            activity,
            lifecycle: Lifecycle::new(),
            finalizer: Mutex::new(Some(finalizer)),
            mtu,
        })
    }

    /// Start the two pump directions over the given upstream
    ///
    /// Worker guards are taken before spawning so a close that races task
    /// startup still waits for both pumps.
    pub(crate) fn spawn_pumps(self: &Arc<Self>, upstream: BoxUpstream) {
        let (read_half, write_half) = tokio::io::split(upstream);
        let to_guard = self.lifecycle.worker_guard();
        let from_guard = self.lifecycle.worker_guard();
        tokio::spawn(copy_to_upstream(Arc::clone(self), write_half, to_guard));
        tokio::spawn(copy_from_upstream(Arc::clone(self), read_half, from_guard));
    }

    /// Time since this flow last moved bytes
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.activity.idle_time()
    }

    pub(crate) fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Request close without waiting; the crash path
    pub(crate) fn close_now(&self) {
        self.lifecycle.request_close();
        self.notifier.wake();
    }

    /// Close and wait until the finalizer has run; idempotent
    pub(crate) async fn close(&self) {
        self.close_now();
        if self.lifecycle.try_begin_finalize() {
            self.lifecycle.wait_ready_to_finalize().await;
            self.run_finalizer();
            self.lifecycle.mark_closed();
        } else {
            self.lifecycle.wait_closed().await;
        }
    }

    fn run_finalizer(&self) {
        if let Some(finalizer) = self.finalizer.lock().take() {
            finalizer();
        }
        self.wait_queue.unregister(&self.notifier);
        self.endpoint.close();
    }

    /// Write the whole buffer to the endpoint, retrying partial writes
    ///
    /// `WouldBlock` sleeps `min(attempt * 1ms, 30ms)` where `attempt`
    /// counts retries since the endpoint last accepted bytes.
    async fn write_to_endpoint(&self, mut buf: &[u8]) -> Result<(), StackError> {
        let mut attempt: u64 = 0;
        while !buf.is_empty() {
            match self.endpoint.write(buf) {
                Ok(n) => {
                    buf = &buf[n..];
                    attempt = 0;
                }
                Err(StackError::WouldBlock) => {
                    let wait = Duration::from_millis(attempt).min(MAX_WRITE_WAIT);
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Endpoint -> upstream direction
async fn copy_to_upstream(
    conn: Arc<Conn>,
    mut upstream: WriteHalf<BoxUpstream>,
    guard: WorkerGuard,
) {
    loop {
        match conn.endpoint.read() {
            Ok((data, _sender)) => {
                if let Err(e) = upstream.write_all(&data).await {
                    error!("unexpected error writing to upstream: {e}");
                    break;
                }
                if !data.is_empty() {
                    conn.activity.mark_active();
                }
                if conn.lifecycle.close_requested() {
                    break;
                }
            }
            Err(StackError::WouldBlock) => {
                tokio::select! {
                    _ = conn.lifecycle.wait_close_requested() => break,
                    _ = conn.notifier.notified() => {}
                }
            }
            Err(StackError::ClosedForReceive | StackError::Closed) => break,
            Err(e) => {
                error!("unexpected error reading from endpoint: {e}");
                break;
            }
        }
    }
    let _ = upstream.shutdown().await;
    drop(guard);
    conn.close_now();
}

/// Upstream -> endpoint direction
async fn copy_from_upstream(
    conn: Arc<Conn>,
    mut upstream: ReadHalf<BoxUpstream>,
    guard: WorkerGuard,
) {
    let buf_size = conn.mtu.saturating_sub(TCPIP_HEADER_BYTES).max(1);
    loop {
        // The stack keeps a reference to injected buffers, so every read
        // gets a fresh allocation.
        let mut buf = vec![0u8; buf_size];
        let n = tokio::select! {
            _ = conn.lifecycle.wait_close_requested() => break,
            result = upstream.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotConnected {
                        error!("unexpected error reading from upstream: {e}");
                    }
                    break;
                }
            },
        };

        if let Err(e) = conn.write_to_endpoint(&buf[..n]).await {
            if !matches!(e, StackError::Closed) {
                error!("unexpected error writing to endpoint: {e}");
            }
            break;
        }
        conn.activity.mark_active();
        trace!("pumped {n} bytes toward endpoint");
    }
    drop(guard);
    debug!("upstream pump exiting, closing flow");
    conn.close().await;
}
