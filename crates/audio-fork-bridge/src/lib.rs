//! # audio-fork-bridge
//!
//! Streams live call audio to remote speech services over WebSocket and
//! hands their replies back to the call-handling layer.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! call-handling layer (media threads, signalling threads)
//!         │ ConnectionHandle: connect / close / finish / write audio / queue text
//!         ▼
//! [audio-fork-bridge]
//!   ├── application/       BridgeService event loop, work queues, drivers
//!   └── infrastructure/
//!         ├── transport    Transport trait seam
//!         ├── websocket    tokio-tungstenite client (ws:// and wss://)
//!         └── mock         in-memory transport for tests
//!         │
//!         ▼
//! remote speech service (WebSocket)
//! ```
//!
//! Pure types (buffers, state machine, events, configuration) live in
//! `audio-fork-core` and are re-exported here.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use audio_fork_bridge::{BridgeEvent, BridgeService, ConnectionConfig, NotifyCallback, ServiceConfig};
//!
//! # fn main() -> Result<(), audio_fork_bridge::BridgeError> {
//! let service = BridgeService::initialize_websocket(ServiceConfig::from_env()?)?;
//! let on_event: NotifyCallback =
//!     Arc::new(|event: BridgeEvent| println!("{}: {:?}", event.session_id, event.kind));
//! let conn = service.create_connection(
//!     ConnectionConfig::new("call-1", "stt.example.com", 443, "/v1/listen"),
//!     on_event,
//! )?;
//! conn.connect()?;
//! conn.lock_audio_buffer().write(&[0u8; 640]);
//! # Ok(())
//! # }
//! ```

/// Application layer: connection handles, event loop, drivers.
pub mod application;

/// Errors returned synchronously by the bridge API.
pub mod error;

/// Infrastructure layer: transports.
pub mod infrastructure;

/// `tracing` subscriber setup.
pub mod logging;

pub use application::{AudioWriteGuard, BridgeService, CloseCompletion, ConnectionHandle};
pub use error::BridgeError;
pub use infrastructure::{Transport, TransportError, WebSocketTransport};

pub use audio_fork_core::{
    AudioWriteOutcome, BridgeEvent, ConnectionConfig, ConnectionState, Credentials, EventKind,
    FinishSignal, NotifyCallback, ServiceConfig, TerminalOutcome, VendorProfile,
};
