//! The proxy root: demultiplexer, reaper, downstream fan-in and lifecycle
//!
//! # Architecture
//!
//! ```text
//!                     +-----------------------------+
//! carrier read  --->  | packet channel (cap 1000)   |
//!                     +--------------+--------------+
//!                                    v
//!                     demux task (+ 1 Hz reaper)
//!                      |        |          |
//!                   TCP dest  UDP flow  ICMP stack
//!                      |        |          |
//!                      +--------+----------+
//!                               v
//!                     fan-in channel ---> carrier write
//! ```
//!
//! A single demux task routes classified packets to their origin (creating
//! one on first sight), so packets of one four-tuple reach the stack in
//! carrier arrival order. The same task ticks once per second to close idle
//! flows and origins; closes are spawned so a slow finalizer never blocks
//! routing. A single fan-in consumer concatenates `{header, data}` pairs
//! from every origin and writes whole packets to the carrier.
//!
//! Error propagation follows one rule: per-flow errors stay in their flow,
//! only carrier read/write failures terminate the proxy.

pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{Opts, ResolvedOpts, Upstream};
use crate::error::{ProxyError, Result};
use crate::flow::tcp::TcpOrigin;
use crate::flow::udp::UdpOrigin;
use crate::lifecycle::{Lifecycle, WorkerGuard};
use crate::packet::{
    Addr, FourTuple, IpPacket, IP_PROTOCOL_ICMP, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP,
};
use crate::stack::{NetStack, PacketInfo, StackConfig};
use self::stats::ProxyStats;

/// Capacity of the classified-packet channel between the carrier reader
/// and the demultiplexer
const PKT_IN_BUFFER: usize = 1000;

/// Interval between reaper passes
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// The downstream carrier byte stream
pub type BoxDownstream = Box<dyn Upstream>;

/// A userspace IP traffic proxy
///
/// Reads raw IPv4 packets from the downstream carrier, terminates TCP/UDP
/// flows in per-destination userspace stacks, bridges each flow to a fresh
/// upstream connection, and writes response packets back to the carrier.
///
/// # Example
///
/// ```no_run
/// use rust_ipproxy::{Opts, Proxy};
///
/// # async fn example(tun: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
/// let proxy = Proxy::new(tun, Opts::default())?;
/// proxy.serve().await?;
/// # Ok(())
/// # }
/// ```
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    opts: ResolvedOpts,
    stats: Arc<ProxyStats>,
    lifecycle: Arc<Lifecycle>,

    /// Carrier reader half, taken by `serve`
    downstream_read: Mutex<Option<ReadHalf<BoxDownstream>>>,
    /// Carrier writer half, taken by the fan-in task
    downstream_write: Mutex<Option<WriteHalf<BoxDownstream>>>,

    pkt_tx: mpsc::Sender<IpPacket>,
    pkt_rx: Mutex<Option<mpsc::Receiver<IpPacket>>>,

    to_downstream_tx: mpsc::Sender<PacketInfo>,
    to_downstream_rx: Mutex<Option<mpsc::Receiver<PacketInfo>>>,

    tcp_dests: Mutex<HashMap<Addr, Arc<TcpOrigin>>>,
    udp_flows: Mutex<HashMap<FourTuple, Arc<UdpOrigin>>>,

    /// First carrier-level error; returned by `serve`
    fatal: Mutex<Option<ProxyError>>,
}

impl Proxy {
    /// Create a proxy over the given downstream carrier
    ///
    /// Options are normalized: zero values become their defaults, missing
    /// dialers and stack provider get the standard implementations.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with `serve`/`close`.
    pub fn new<D>(downstream: D, opts: Opts) -> Result<Self>
    where
        D: Upstream + 'static,
    {
        let opts = opts.resolve();
        let (read_half, write_half) = tokio::io::split(Box::new(downstream) as BoxDownstream);
        let (pkt_tx, pkt_rx) = mpsc::channel(PKT_IN_BUFFER);
        // Closest tokio equivalent of a rendezvous channel: the fan-in
        // consumer back-pressures origin drainers almost immediately.
        let (to_downstream_tx, to_downstream_rx) = mpsc::channel(1);

        Ok(Self {
            inner: Arc::new(ProxyInner {
                opts,
                stats: Arc::new(ProxyStats::new()),
                lifecycle: Lifecycle::new(),
                downstream_read: Mutex::new(Some(read_half)),
                downstream_write: Mutex::new(Some(write_half)),
                pkt_tx,
                pkt_rx: Mutex::new(Some(pkt_rx)),
                to_downstream_tx,
                to_downstream_rx: Mutex::new(Some(to_downstream_rx)),
                tcp_dests: Mutex::new(HashMap::new()),
                udp_flows: Mutex::new(HashMap::new()),
                fatal: Mutex::new(None),
            }),
        })
    }

    /// Start proxying; blocks until the proxy terminates
    ///
    /// Returns [`ProxyError::DownstreamClosed`] when the carrier reaches
    /// end-of-stream, the wrapped carrier error on read/write failure, and
    /// `Ok(())` when terminated by [`close`](Self::close). May only be
    /// called once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Carrier-level failures only; per-flow errors never propagate here.
    pub async fn serve(&self) -> Result<()> {
        let inner = &self.inner;

        let Some(read_half) = inner.downstream_read.lock().take() else {
            return Ok(());
        };
        let Some(pkt_rx) = inner.pkt_rx.lock().take() else {
            return Ok(());
        };

        // The dedicated ICMP origin lives for the proxy's full lifetime
        let (icmp_stack, icmp_outbound) = inner.stack_for_icmp()?;
        let icmp_guard = inner.lifecycle.worker_guard();
        tokio::spawn(icmp_drain_loop(
            Arc::clone(inner),
            icmp_outbound,
            icmp_guard,
        ));

        let stats_guard = inner.lifecycle.worker_guard();
        tokio::spawn(stats_loop(Arc::clone(inner), stats_guard));

        if let Some(write_half) = inner.downstream_write.lock().take() {
            if let Some(rx) = inner.to_downstream_rx.lock().take() {
                tokio::spawn(downstream_write_loop(Arc::clone(inner), rx, write_half));
            }
        }

        let demux_guard = inner.lifecycle.worker_guard();
        let demux = tokio::spawn(demux_loop(Arc::clone(inner), pkt_rx, icmp_stack, demux_guard));

        let result = inner.read_downstream_packets(read_half).await;

        inner.lifecycle.request_close();
        // Wait for the demux task to finish closing every origin
        let _ = demux.await;
        self.close().await?;
        result
    }

    /// Shut down in an orderly fashion; blocks until complete, idempotent
    ///
    /// # Errors
    ///
    /// Currently always `Ok`; kept fallible so callers can treat shutdown
    /// failures uniformly with `serve`.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.request_close();
        if inner.lifecycle.try_begin_finalize() {
            inner.lifecycle.wait_ready_to_finalize().await;
            inner.lifecycle.mark_closed();
        } else {
            inner.lifecycle.wait_closed().await;
        }
        Ok(())
    }

    /// Proxy-wide counters
    #[must_use]
    pub fn stats(&self) -> &ProxyStats {
        &self.inner.stats
    }

    /// Count of accepted packets
    #[must_use]
    pub fn accepted_packets(&self) -> u64 {
        self.inner.stats.accepted_packets()
    }

    /// Count of rejected packets
    #[must_use]
    pub fn rejected_packets(&self) -> u64 {
        self.inner.stats.rejected_packets()
    }

    /// Number of TCP origins being tracked
    #[must_use]
    pub fn num_tcp_origins(&self) -> u64 {
        self.inner.stats.num_tcp_origins()
    }

    /// Number of TCP connections being tracked
    #[must_use]
    pub fn num_tcp_conns(&self) -> u64 {
        self.inner.stats.num_tcp_conns()
    }

    /// Number of UDP flows being tracked
    #[must_use]
    pub fn num_udp_conns(&self) -> u64 {
        self.inner.stats.num_udp_conns()
    }
}

impl ProxyInner {
    /// Build the promiscuous stack that answers ICMP itself
    fn stack_for_icmp(&self) -> Result<(Arc<dyn NetStack>, mpsc::Receiver<PacketInfo>)> {
        let handle = (self.opts.stack_provider)(StackConfig {
            mtu: self.opts.mtu,
            outbound_buffer_depth: self.opts.outbound_buffer_depth,
        })?;
        handle.stack.create_nic()?;
        handle.stack.set_promiscuous(true)?;
        Ok((handle.stack, handle.outbound))
    }

    /// Carrier read loop: one fresh MTU-sized buffer per packet
    async fn read_downstream_packets(
        self: &Arc<Self>,
        mut read_half: ReadHalf<BoxDownstream>,
    ) -> Result<()> {
        loop {
            // Buffer ownership transfers into the stack on inject, so a
            // fresh allocation per read is mandatory.
            let mut buf = vec![0u8; self.opts.mtu];
            let n = tokio::select! {
                _ = self.lifecycle.wait_close_requested() => {
                    return match self.fatal.lock().take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => return Err(ProxyError::DownstreamClosed),
                    Ok(n) => n,
                    Err(e) => return Err(ProxyError::DownstreamRead(e)),
                },
            };
            buf.truncate(n);

            match IpPacket::parse(buf) {
                Ok(pkt) => {
                    if self.pkt_tx.send(pkt).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    debug!("error on inbound packet, ignoring: {e}");
                    self.stats.packet_rejected();
                }
            }
        }
    }

    /// Route one classified packet to its origin
    async fn dispatch(self: &Arc<Self>, pkt: IpPacket, icmp_stack: &Arc<dyn NetStack>) {
        match pkt.proto {
            IP_PROTOCOL_TCP => {
                self.stats.packet_accepted();
                self.on_tcp(pkt);
            }
            IP_PROTOCOL_UDP => {
                self.stats.packet_accepted();
                self.on_udp(pkt).await;
            }
            IP_PROTOCOL_ICMP => {
                self.stats.packet_accepted();
                icmp_stack.inject(pkt.raw);
            }
            other => {
                self.stats.packet_rejected();
                debug!("unknown IP protocol, ignoring: {other}");
            }
        }
    }

    fn on_tcp(self: &Arc<Self>, pkt: IpPacket) {
        let dst = pkt.ft.dst;
        let existing = self.tcp_dests.lock().get(&dst).cloned();
        let dest = match existing {
            Some(dest) => dest,
            None => match self.start_tcp_dest(dst) {
                Ok(dest) => {
                    self.tcp_dests.lock().insert(dst, Arc::clone(&dest));
                    self.stats.tcp_origin_opened();
                    dest
                }
                Err(e) => {
                    error!("{e}");
                    return;
                }
            },
        };
        dest.inject(pkt.raw);
    }

    fn start_tcp_dest(self: &Arc<Self>, dst: Addr) -> Result<Arc<TcpOrigin>> {
        let weak = Arc::downgrade(self);
        let dest = TcpOrigin::start(
            dst,
            &self.opts,
            self.to_downstream_tx.clone(),
            Arc::clone(&self.stats),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.stats.tcp_origin_closed();
                }
            }),
        )?;

        // The finalizer must only remove this exact instance: by the time
        // it runs, the reaper may already have installed a successor.
        let id = dest.origin().id();
        let weak = Arc::downgrade(self);
        dest.origin().set_removal(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut dests = inner.tcp_dests.lock();
                if dests.get(&dst).map(|d| d.origin().id()) == Some(id) {
                    dests.remove(&dst);
                }
            }
        }));
        Ok(dest)
    }

    async fn on_udp(self: &Arc<Self>, pkt: IpPacket) {
        let ft = pkt.ft;
        let existing = self.udp_flows.lock().get(&ft).cloned();
        let flow = match existing {
            Some(flow) => flow,
            None => match self.start_udp_flow(ft).await {
                Ok(flow) => {
                    self.udp_flows.lock().insert(ft, Arc::clone(&flow));
                    flow
                }
                Err(e) => {
                    error!("{e}");
                    return;
                }
            },
        };
        flow.inject(pkt.raw);
    }

    async fn start_udp_flow(self: &Arc<Self>, ft: FourTuple) -> Result<Arc<UdpOrigin>> {
        let flow = UdpOrigin::start(
            ft,
            &self.opts,
            self.to_downstream_tx.clone(),
            Arc::clone(&self.stats),
            Box::new(|| {}),
        )
        .await?;

        let id = flow.origin().id();
        let weak = Arc::downgrade(self);
        flow.origin().set_removal(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut flows = inner.udp_flows.lock();
                if flows.get(&ft).map(|f| f.origin().id()) == Some(id) {
                    flows.remove(&ft);
                }
            }
        }));
        Ok(flow)
    }

    /// One reaper pass over the TCP destinations
    fn reap_tcp(self: &Arc<Self>) {
        let dests: Vec<(Addr, Arc<TcpOrigin>)> = self
            .tcp_dests
            .lock()
            .iter()
            .map(|(addr, dest)| (*addr, Arc::clone(dest)))
            .collect();

        for (addr, dest) in dests {
            let conns = dest.origin().snapshot_clients();
            if conns.is_empty() {
                if dest.origin().activity().idle_time() > self.opts.idle_timeout {
                    debug!("reaping idle TCP destination {addr}");
                    self.tcp_dests.lock().remove(&addr);
                    tokio::spawn(async move { dest.close().await });
                }
            } else {
                for conn in conns {
                    if conn.idle_time() > self.opts.idle_timeout {
                        tokio::spawn(async move { conn.close().await });
                    }
                }
            }
        }
    }

    /// One reaper pass over the UDP flows
    fn reap_udp(self: &Arc<Self>) {
        let flows: Vec<(FourTuple, Arc<UdpOrigin>)> = self
            .udp_flows
            .lock()
            .iter()
            .map(|(ft, flow)| (*ft, Arc::clone(flow)))
            .collect();

        for (ft, flow) in flows {
            if flow.origin().activity().idle_time() > self.opts.idle_timeout {
                debug!("reaping idle UDP flow {ft}");
                self.udp_flows.lock().remove(&ft);
                tokio::spawn(async move { flow.close().await });
            }
        }
    }

    /// Close every origin; run by the demux task on shutdown
    async fn close_all_origins(self: &Arc<Self>) {
        let dests: Vec<Arc<TcpOrigin>> =
            self.tcp_dests.lock().drain().map(|(_, d)| d).collect();
        for dest in dests {
            dest.close().await;
        }
        let flows: Vec<Arc<UdpOrigin>> =
            self.udp_flows.lock().drain().map(|(_, f)| f).collect();
        for flow in flows {
            flow.close().await;
        }
    }
}

/// The demultiplexer: routes packets, ticks the reaper, and on shutdown
/// closes every origin before releasing its worker guard
async fn demux_loop(
    inner: Arc<ProxyInner>,
    mut pkt_rx: mpsc::Receiver<IpPacket>,
    icmp_stack: Arc<dyn NetStack>,
    guard: WorkerGuard,
) {
    let mut reap_tick = tokio::time::interval(REAP_INTERVAL);
    reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.lifecycle.wait_close_requested() => break,
            _ = reap_tick.tick() => {
                inner.reap_tcp();
                inner.reap_udp();
            }
            pkt = pkt_rx.recv() => match pkt {
                Some(pkt) => inner.dispatch(pkt, &icmp_stack).await,
                None => break,
            },
        }
    }

    icmp_stack.close();
    inner.close_all_origins().await;
    drop(guard);
    debug!("demux task exited");
}

/// Forward the ICMP stack's replies into the fan-in channel
async fn icmp_drain_loop(
    inner: Arc<ProxyInner>,
    mut outbound: mpsc::Receiver<PacketInfo>,
    guard: WorkerGuard,
) {
    loop {
        let pkt = tokio::select! {
            _ = inner.lifecycle.wait_close_requested() => break,
            pkt = outbound.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        tokio::select! {
            _ = inner.lifecycle.wait_close_requested() => break,
            result = inner.to_downstream_tx.send(pkt) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
    drop(guard);
}

/// The single fan-in consumer: concatenate and write whole packets
///
/// Keeps draining until the proxy is fully closed so packets already
/// accepted by the channel still reach the carrier during shutdown.
async fn downstream_write_loop(
    inner: Arc<ProxyInner>,
    mut rx: mpsc::Receiver<PacketInfo>,
    mut write_half: WriteHalf<BoxDownstream>,
) {
    loop {
        let pkt = tokio::select! {
            _ = inner.lifecycle.wait_closed() => break,
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };

        let mut buf = Vec::with_capacity(inner.opts.mtu);
        buf.extend_from_slice(&pkt.header);
        buf.extend_from_slice(&pkt.data);
        if let Err(e) = write_half.write_all(&buf).await {
            error!("unexpected error writing to downstream: {e}");
            *inner.fatal.lock() = Some(ProxyError::DownstreamWrite(e));
            inner.lifecycle.request_close();
            break;
        }
    }
}

/// Log counter snapshots at the stats interval, only when they changed
async fn stats_loop(inner: Arc<ProxyInner>, guard: WorkerGuard) {
    let mut interval = tokio::time::interval(inner.opts.stats_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = inner.stats.snapshot();
    loop {
        tokio::select! {
            _ = inner.lifecycle.wait_close_requested() => break,
            _ = interval.tick() => {
                let snapshot = inner.stats.snapshot();
                if snapshot != last {
                    info!(
                        accepted = snapshot.accepted_packets,
                        rejected = snapshot.rejected_packets,
                        tcp_origins = snapshot.num_tcp_origins,
                        tcp_conns = snapshot.num_tcp_conns,
                        udp_conns = snapshot.num_udp_conns,
                        "proxy stats",
                    );
                    last = snapshot;
                }
            }
        }
    }
    drop(guard);
}
