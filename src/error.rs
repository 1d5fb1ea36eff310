//! Error types for the proxy
//!
//! Only carrier-level failures terminate the proxy; everything that happens
//! inside a single flow (dial failures, upstream resets, endpoint errors) is
//! handled and logged where it occurs and never propagates past that flow.
//!
//! # Error Categories
//!
//! - **Fatal**: downstream carrier read/write failures. `serve()` returns
//!   these.
//! - **Terminal-normal**: downstream EOF (`DownstreamClosed`). The proxy
//!   shuts down cleanly; `serve()` still surfaces it so callers can tell an
//!   orderly carrier close from a transport fault.
//! - **Per-flow**: origin setup and stack errors. Reported to the caller of
//!   the failing operation only.

use std::io;

use thiserror::Error;

use crate::stack::StackError;

/// Errors surfaced by the proxy's public operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The downstream carrier reached end-of-stream
    #[error("downstream closed")]
    DownstreamClosed,

    /// Reading from the downstream carrier failed
    #[error("downstream read error: {0}")]
    DownstreamRead(#[source] io::Error),

    /// Writing a packet to the downstream carrier failed
    #[error("downstream write error: {0}")]
    DownstreamWrite(#[source] io::Error),

    /// Constructing an origin's userspace stack failed
    #[error("origin setup failed for {addr}: {source}")]
    OriginSetup {
        /// Destination the origin was being created for
        addr: String,
        /// Underlying stack error
        source: StackError,
    },

    /// Dialing the upstream for a flow failed; only that flow is affected
    #[error("upstream dial to {addr} failed: {source}")]
    UpstreamDial {
        /// Destination that was being dialed
        addr: String,
        /// Underlying I/O error
        source: io::Error,
    },

    /// A userspace stack operation failed
    #[error("stack error: {0}")]
    Stack(#[from] StackError),
}

impl ProxyError {
    /// Returns true if this error terminates the whole proxy
    ///
    /// Per-flow errors (`OriginSetup`, `Stack`) affect only the flow they
    /// occurred on.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DownstreamClosed | Self::DownstreamRead(_) | Self::DownstreamWrite(_)
        )
    }

    /// Returns true if this is the orderly end-of-stream termination
    #[must_use]
    pub fn is_downstream_closed(&self) -> bool {
        matches!(self, Self::DownstreamClosed)
    }
}

/// A specialized Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
