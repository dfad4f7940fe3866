//! # audio-fork-core
//!
//! Shared library for the streaming audio bridge containing the buffers, the
//! connection state machine, the event vocabulary and the configuration types.
//!
//! This crate is used by the bridge runtime (`audio-fork-bridge`) and by the
//! probe binary.  It has zero dependencies on sockets, async runtimes or
//! threads, so every rule it encodes can be tested synchronously.
//!
//! # Architecture overview
//!
//! A call leg produces PCM audio on a telephony media thread.  The bridge
//! forwards that audio to a remote speech service over a WebSocket and hands
//! the service's replies back to the call-handling layer.  This crate defines
//! the pieces that do not care *how* bytes move:
//!
//! - **`buffer`** – The outbound [`AudioRingBuffer`] the producer fills and the
//!   network thread drains, and the inbound [`FrameBuffer`] that reassembles
//!   fragmented messages under a hard size cap.
//!
//! - **`domain`** – The [`ConnectionState`] machine, the [`BridgeEvent`]s
//!   delivered to the notify callback, the wire-level frame types, and the
//!   [`ConnectionConfig`] / [`ServiceConfig`] settings.

pub mod buffer;
pub mod domain;

pub use buffer::audio::{AudioRingBuffer, AudioWriteOutcome, BufferError};
pub use buffer::frame::{AssembledMessage, FragmentOutcome, FrameBuffer, FrameLimits};
pub use domain::config::{
    ConfigError, ConnectionConfig, Credentials, FinishSignal, ServiceConfig, VendorProfile,
};
pub use domain::event::{BridgeEvent, EventKind, NotifyCallback, TerminalOutcome};
pub use domain::frames::{InboundFragment, OutboundFrame, PayloadKind};
pub use domain::state::{AtomicConnectionState, ConnectionState};
