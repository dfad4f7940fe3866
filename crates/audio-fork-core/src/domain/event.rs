//! Events delivered to the call-handling layer.
//!
//! Every connection is constructed with one [`NotifyCallback`].  The bridge
//! calls it synchronously on the event-loop thread for every lifecycle and
//! data event, so the callback must return quickly and must never block.
//!
//! # Terminal events
//!
//! `ConnectFail`, `ConnectionDropped` and `ConnectionClosedGracefully` are
//! terminal.  Exactly one of them fires per connection and nothing fires
//! afterwards; the callback is the last point at which the connection may be
//! observed.

use std::fmt;
use std::sync::Arc;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The WebSocket handshake completed.
    ConnectSuccess,
    /// The connection could not be established.
    ConnectFail { reason: String },
    /// The remote end went away without a local close.
    ConnectionDropped,
    /// A local `close()` completed, or the remote closed after `finish()`.
    ConnectionClosedGracefully,
    /// A complete inbound text message.
    Message(String),
    /// A complete inbound binary message (bidirectional profiles only).
    Binary(Vec<u8>),
    /// Audio production outran the network; pending audio was dropped.
    BufferOverrun,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectFail { .. } | Self::ConnectionDropped | Self::ConnectionClosedGracefully
        )
    }

    /// Short name for log lines; never includes the payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectSuccess => "connect_success",
            Self::ConnectFail { .. } => "connect_fail",
            Self::ConnectionDropped => "connection_dropped",
            Self::ConnectionClosedGracefully => "connection_closed_gracefully",
            Self::Message(_) => "message",
            Self::Binary(_) => "binary",
            Self::BufferOverrun => "buffer_overrun",
        }
    }

    /// The terminal outcome this event represents, if any.
    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        match self {
            Self::ConnectFail { .. } => Some(TerminalOutcome::Failed),
            Self::ConnectionDropped => Some(TerminalOutcome::Dropped),
            Self::ConnectionClosedGracefully => Some(TerminalOutcome::ClosedGracefully),
            _ => None,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalOutcome {
    Failed,
    Dropped,
    ClosedGracefully,
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Failed => "failed",
            Self::Dropped => "dropped",
            Self::ClosedGracefully => "closed gracefully",
        })
    }
}

/// One notification for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    /// Call/session identifier the connection was created with.
    pub session_id: String,
    /// Logical tag of the vendor profile (e.g. `"audio_fork"`).
    pub tag: String,
    pub kind: EventKind,
}

/// Handler invoked for every [`BridgeEvent`].
pub type NotifyCallback = Arc<dyn Fn(BridgeEvent) + Send + Sync>;
