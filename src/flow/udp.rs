//! UDP flow: an origin keyed by four-tuple with one upstream socket
//!
//! The first datagram of an unknown four-tuple dials the upstream, builds
//! an origin whose endpoint is bound to the destination and connected back
//! to the downstream source, and starts one pump pair. Later datagrams on
//! the same four-tuple reuse the origin by injecting their raw bytes.
//!
//! A UDP flow has exactly one logical client, so the flow's activity
//! tracker is shared between the origin and its connection; the reaper
//! looks at the origin.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use super::origin::Origin;
use super::{Conn, Finalizer};
use crate::config::ResolvedOpts;
use crate::error::ProxyError;
use crate::packet::FourTuple;
use crate::proxy::stats::ProxyStats;
use crate::stack::{PacketInfo, TransportProtocol};

/// An origin specialized for UDP: one four-tuple, one upstream socket
#[derive(Debug)]
pub struct UdpOrigin {
    origin: Arc<Origin>,
    ft: FourTuple,
}

impl UdpOrigin {
    /// Dial the upstream, build the origin and start the pumps
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UpstreamDial`] if the dial fails and
    /// [`ProxyError::OriginSetup`] if stack construction fails; nothing is
    /// installed in either case.
    pub(crate) async fn start(
        ft: FourTuple,
        opts: &ResolvedOpts,
        fan_in: mpsc::Sender<PacketInfo>,
        stats: Arc<ProxyStats>,
        finalizer: Finalizer,
    ) -> Result<Arc<Self>, ProxyError> {
        let upstream = (opts.dial_udp)(ft.dst.socket_addr())
            .await
            .map_err(|source| ProxyError::UpstreamDial {
                addr: ft.dst.to_string(),
                source,
            })?;

        let origin = Origin::new(ft.dst, TransportProtocol::Udp, opts, fan_in, finalizer)?;
        if let Err(source) = origin.endpoint().connect(ft.src.socket_addr()) {
            tokio::spawn(async move { origin.close().await });
            return Err(ProxyError::OriginSetup {
                addr: ft.dst.to_string(),
                source,
            });
        }

        let src_addr = ft.src.socket_addr();
        let weak_origin = Arc::downgrade(&origin);
        let conn_stats = Arc::clone(&stats);
        let conn = Conn::new(
            Arc::clone(origin.endpoint()),
            Arc::clone(origin.wait_queue()),
            Arc::clone(origin.activity()),
            opts.mtu,
            Box::new(move || {
                conn_stats.udp_conn_closed();
                if let Some(origin) = weak_origin.upgrade() {
                    origin.remove_client(src_addr);
                    tokio::spawn(async move { origin.close().await });
                }
            }),
        );
        origin.add_client(src_addr, Arc::clone(&conn));
        stats.udp_conn_opened();
        conn.spawn_pumps(upstream);

        debug!("started UDP flow {ft}");
        Ok(Arc::new(Self { origin, ft }))
    }

    /// The four-tuple this flow bridges
    #[must_use]
    pub fn four_tuple(&self) -> FourTuple {
        self.ft
    }

    /// The origin backing this flow
    #[must_use]
    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub(crate) fn inject(&self, raw: Vec<u8>) {
        self.origin.inject(raw);
    }

    pub(crate) async fn close(&self) {
        self.origin.close().await;
    }
}

/// Adapter presenting a connected `UdpSocket` as a byte stream where every
/// read yields exactly one datagram and every write sends one
pub struct UdpDatagramStream {
    socket: UdpSocket,
}

impl UdpDatagramStream {
    /// Wrap a connected socket
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpDatagramStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpDatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
