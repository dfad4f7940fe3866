//! The transport seam between the connection driver and the network.
//!
//! The driver never touches a socket library.  It asks a [`Transport`] to open
//! a connection for a [`ConnectionConfig`] and receives two halves back:
//!
//! - a [`FrameSink`] it sends [`OutboundFrame`]s into, and
//! - a [`FrameSource`] it pulls [`TransportEvent`]s from.
//!
//! Production code uses [`WebSocketTransport`](super::websocket::WebSocketTransport);
//! tests use [`MockTransport`](super::mock::MockTransport), which records
//! every outbound frame and lets the test script the remote side.
//!
//! # Cancellation
//!
//! The driver polls `next_event()` inside `tokio::select!` alongside its
//! timers and write wake-ups, so a pending `next_event()` future may be
//! dropped at any await point.  Implementations must not lose an event when
//! that happens.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use audio_fork_core::{ConnectionConfig, InboundFragment, OutboundFrame};

/// Failures reported by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP, TLS or the WebSocket handshake failed.
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    /// The handshake did not finish in time.
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    /// The upgrade request could not be built (bad URL or header value).
    #[error("invalid upgrade request: {0}")]
    InvalidRequest(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// Something that arrived from the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A piece (or the whole) of a data message.
    Fragment(InboundFragment),
    /// A ping or pong control frame.  Only proves the peer is alive.
    Heartbeat,
    /// The remote sent a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// Outbound half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one frame and returns the number of payload bytes written.
    ///
    /// A return value smaller than [`OutboundFrame::len`] is a short write.
    async fn send(&mut self, frame: OutboundFrame) -> Result<usize, TransportError>;
}

/// Inbound half of an open connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next event.  `None` means the connection ended without
    /// a close frame.
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>>;
}

/// Both halves of an open connection.
pub struct TransportPair {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens connections.  One instance is shared by every connection the
/// service drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<TransportPair, TransportError>;
}
