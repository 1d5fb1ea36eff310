//! TCP destination: an origin that listens and accepts downstream flows
//!
//! One `TcpOrigin` exists per distinct destination address. Its endpoint
//! listens on the synthesized local address; every downstream connection
//! the stack accepts gets one fresh upstream dial and one [`Conn`] with two
//! pump tasks.
//!
//! The acceptor terminates on the first upstream dial failure, taking the
//! whole destination with it; the destination is reaped once idle and a
//! later packet recreates it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::origin::Origin;
use super::{ActivityTracker, Conn, Finalizer};
use crate::config::ResolvedOpts;
use crate::error::ProxyError;
use crate::lifecycle::WorkerGuard;
use crate::packet::Addr;
use crate::proxy::stats::ProxyStats;
use crate::stack::{PacketInfo, StackError, TransportProtocol};

/// An origin specialized for TCP: listener plus per-flow connections
pub struct TcpOrigin {
    origin: Arc<Origin>,
}

impl TcpOrigin {
    /// Create the destination, start listening and spawn the acceptor
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::OriginSetup`] if stack construction or
    /// `listen` fails; nothing is installed in that case.
    pub(crate) fn start(
        addr: Addr,
        opts: &ResolvedOpts,
        fan_in: mpsc::Sender<PacketInfo>,
        stats: Arc<ProxyStats>,
        finalizer: Finalizer,
    ) -> Result<Arc<Self>, ProxyError> {
        let origin = Origin::new(addr, TransportProtocol::Tcp, opts, fan_in, finalizer)?;

        if let Err(source) = origin.endpoint().listen(opts.tcp_connect_backlog) {
            tokio::spawn(async move { origin.close().await });
            return Err(ProxyError::OriginSetup {
                addr: addr.to_string(),
                source,
            });
        }

        let dest = Arc::new(Self { origin });
        let guard = dest.origin.lifecycle().worker_guard();
        tokio::spawn(accept_loop(
            Arc::clone(&dest.origin),
            opts.clone(),
            stats,
            guard,
        ));
        Ok(dest)
    }

    /// The origin backing this destination
    #[must_use]
    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    /// Number of tracked downstream connections
    #[must_use]
    pub fn num_conns(&self) -> usize {
        self.origin.num_clients()
    }

    pub(crate) fn inject(&self, raw: Vec<u8>) {
        self.origin.inject(raw);
    }

    pub(crate) async fn close(&self) {
        self.origin.close().await;
    }
}

/// Accept downstream connections until the destination closes or fails
async fn accept_loop(
    origin: Arc<Origin>,
    opts: ResolvedOpts,
    stats: Arc<ProxyStats>,
    guard: WorkerGuard,
) {
    loop {
        match origin.endpoint().accept() {
            Ok((endpoint, wait_queue)) => {
                let remote = endpoint.remote_addr().unwrap_or(SocketAddr::V4(
                    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
                ));
                debug!("accepted downstream connection from {remote} to {}", origin.addr());

                let upstream = match (opts.dial_tcp)(origin.addr().socket_addr()).await {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        // First dial failure kills the whole destination
                        error!(
                            "unexpected error dialing upstream to {}: {e}",
                            origin.addr()
                        );
                        break;
                    }
                };

                let conn_origin = Arc::clone(&origin);
                let conn_stats = Arc::clone(&stats);
                let conn = Conn::new(
                    endpoint,
                    wait_queue,
                    ActivityTracker::new(),
                    opts.mtu,
                    Box::new(move || {
                        conn_origin.remove_client(remote);
                        conn_stats.tcp_conn_closed();
                    }),
                );
                origin.add_client(remote, Arc::clone(&conn));
                stats.tcp_conn_opened();
                conn.spawn_pumps(upstream);
            }
            Err(StackError::WouldBlock) => {
                tokio::select! {
                    _ = origin.lifecycle().wait_close_requested() => break,
                    _ = origin.notifier().notified() => {}
                }
            }
            Err(e) => {
                if !origin.lifecycle().close_requested() {
                    error!("accept on {} failed: {e}", origin.addr());
                }
                break;
            }
        }
    }
    drop(guard);
    origin.close_now();
}
