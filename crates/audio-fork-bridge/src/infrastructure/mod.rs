//! Infrastructure layer for audio-fork-bridge.
//!
//! - [`transport`] – the async trait seam the driver talks to
//! - [`websocket`] – the production WebSocket client (tokio-tungstenite)
//! - [`mock`] – an in-memory transport whose remote end is driven by tests

pub mod mock;
pub mod transport;
pub mod websocket;

pub use transport::{FrameSink, FrameSource, Transport, TransportError, TransportEvent, TransportPair};
pub use websocket::WebSocketTransport;
