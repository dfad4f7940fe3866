//! Byte buffers shared between the call-audio producer and the network thread.
//!
//! - [`audio`] – fixed-capacity outbound PCM buffer with a reserved header
//!   region and an edge-triggered overrun flag.
//! - [`frame`] – growable inbound reassembly buffer with a hard cap.

pub mod audio;
pub mod frame;

pub use audio::{AudioRingBuffer, AudioWriteOutcome, BufferError};
pub use frame::{AssembledMessage, FragmentOutcome, FrameBuffer, FrameLimits};
