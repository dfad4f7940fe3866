//! Application layer for audio-fork-bridge.
//!
//! Knows *what* happens to a connection and when: the caller-facing handle,
//! the cross-thread work queues, the event loop that drains them, and the
//! per-connection driver that turns queued work into frames.  *How* bytes
//! reach the remote service is delegated to a
//! [`Transport`](crate::infrastructure::transport::Transport).
//!
//! # Threads
//!
//! - Caller threads use [`ConnectionHandle`] and never block on I/O.
//! - The single `audio-fork-loop` thread runs [`BridgeService`]'s loop and
//!   every driver.

pub mod connection;
mod driver;
pub mod queues;
pub mod service;

pub use connection::{AudioWriteGuard, CloseCompletion, ConnectionHandle};
pub use service::BridgeService;
