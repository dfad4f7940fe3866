//! Domain types for the streaming audio bridge.
//!
//! Contains only pure types with no I/O:
//! - [`state`] – the per-connection state machine
//! - [`event`] – events delivered to the notify callback
//! - [`frames`] – transport-neutral inbound fragments and outbound frames
//! - [`config`] – connection and service settings

pub mod config;
pub mod event;
pub mod frames;
pub mod state;

pub use config::{ConfigError, ConnectionConfig, Credentials, FinishSignal, ServiceConfig, VendorProfile};
pub use event::{BridgeEvent, EventKind, NotifyCallback, TerminalOutcome};
pub use frames::{InboundFragment, OutboundFrame, PayloadKind};
pub use state::{AtomicConnectionState, ConnectionState};
