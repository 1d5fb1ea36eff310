//! Three-phase close lifecycle shared by every long-lived object
//!
//! The proxy, each origin and each connection all shut down the same way,
//! through three one-shot signals:
//!
//! 1. `close_request`: stop accepting new work. Workers observe this and
//!    exit their loops.
//! 2. `ready_to_finalize`: all owned workers have exited; it is now safe to
//!    run the finalizer (which may touch upstream sockets, maps and stacks).
//! 3. `closed`: the finalizer has run.
//!
//! The signals are `tokio::sync::watch` channels so that late subscribers
//! still observe a phase that fired before they started waiting. The
//! finalizer is guarded by a compare-and-swap so it runs exactly once no
//! matter how many tasks race into `close()`; losers wait on `closed`.
//!
//! Workers are tracked with [`WorkerGuard`]s: each spawned task holds one,
//! and the last guard dropped after a close request fires
//! `ready_to_finalize`. A close request with no live workers fires it
//! immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// The shared three-signal close state
#[derive(Debug)]
pub struct Lifecycle {
    close_request: watch::Sender<bool>,
    ready_to_finalize: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    /// Live worker guards
    workers: AtomicUsize,
    /// Set by the task that won the right to run the finalizer
    finalizing: AtomicBool,
}

impl Lifecycle {
    /// Create a fresh lifecycle with no signal fired
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            close_request: watch::channel(false).0,
            ready_to_finalize: watch::channel(false).0,
            closed: watch::channel(false).0,
            workers: AtomicUsize::new(0),
            finalizing: AtomicBool::new(false),
        })
    }

    /// Fire `close_request`; idempotent, never blocks
    ///
    /// This is the crash path (`close_now` in the public API): it tells all
    /// workers to stop but does not wait for anything. If no workers are
    /// live, `ready_to_finalize` fires as well.
    pub fn request_close(&self) {
        self.close_request.send_replace(true);
        if self.workers.load(Ordering::Acquire) == 0 {
            self.mark_ready_to_finalize();
        }
    }

    /// Whether `close_request` has fired
    #[must_use]
    pub fn close_requested(&self) -> bool {
        *self.close_request.borrow()
    }

    /// Whether `closed` has fired
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until `close_request` fires
    pub async fn wait_close_requested(&self) {
        Self::wait(&self.close_request).await;
    }

    /// Wait until all workers have exited after a close request
    pub async fn wait_ready_to_finalize(&self) {
        Self::wait(&self.ready_to_finalize).await;
    }

    /// Wait until the finalizer has run
    pub async fn wait_closed(&self) {
        Self::wait(&self.closed).await;
    }

    /// Claim the right to run the finalizer
    ///
    /// Exactly one caller per lifecycle gets `true`; everyone else should
    /// wait on `closed`.
    pub fn try_begin_finalize(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark all workers as exited
    pub fn mark_ready_to_finalize(&self) {
        self.ready_to_finalize.send_replace(true);
    }

    /// Mark the finalizer as complete
    pub fn mark_closed(&self) {
        self.ready_to_finalize.send_replace(true);
        self.closed.send_replace(true);
    }

    /// Register a worker task; drop the guard when the task exits
    #[must_use]
    pub fn worker_guard(self: &Arc<Self>) -> WorkerGuard {
        self.workers.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            lifecycle: Arc::clone(self),
        }
    }

    async fn wait(signal: &watch::Sender<bool>) {
        let mut rx = signal.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Tracks one live worker task of a [`Lifecycle`]
///
/// The last guard dropped after a close request fires `ready_to_finalize`.
/// A worker that wants to trigger its owner's close must drop its guard
/// first, otherwise the close would wait on the worker's own exit.
#[derive(Debug)]
pub struct WorkerGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let remaining = self.lifecycle.workers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.lifecycle.close_requested() {
            self.lifecycle.mark_ready_to_finalize();
        }
    }
}
