//! Fixed-capacity outbound audio buffer.
//!
//! The call-audio producer copies PCM into the buffer at the write cursor; the
//! network thread periodically takes everything between the header reserve
//! and the cursor and sends it as one binary frame.
//!
//! ```text
//! 0          header_reserve                cursor                capacity
//! |----------|=============================|.....................|
//!   reserved    pending PCM (next frame)       space_available()
//! ```
//!
//! # Overrun policy
//!
//! When a write does not fit, the buffer is reset to empty (everything between
//! the reserve and the cursor is dropped) rather than trimming the oldest
//! samples.  The incoming chunk is then written if it fits into the emptied
//! buffer.  Only the first overrun of a connect cycle asks the caller to
//! notify upstream; [`AudioRingBuffer::begin_cycle`] re-arms the flag.
//!
//! # Thread safety
//!
//! The type itself is not synchronized.  The bridge wraps it in a mutex owned
//! by the connection, so the producer and the network thread never observe a
//! half-updated cursor.

use thiserror::Error;

/// Errors returned by [`AudioRingBuffer`] construction and cursor moves.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The header reserve leaves no room for audio.
    #[error("header reserve {reserve} must be smaller than capacity {capacity}")]
    ReserveTooLarge { reserve: usize, capacity: usize },

    /// [`AudioRingBuffer::advance`] was asked to move past the end.
    #[error("cannot advance by {requested} bytes; only {available} available")]
    Overflow { requested: usize, available: usize },
}

/// Result of a single [`AudioRingBuffer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioWriteOutcome {
    /// All bytes were copied.
    Written(usize),
    /// The write did not fit.  Pending data was discarded.
    Overrun {
        /// Bytes thrown away (previously pending plus any incoming bytes that
        /// still did not fit after the reset).
        dropped: usize,
        /// Bytes of the incoming chunk that were written after the reset.
        written: usize,
        /// `true` only for the first overrun since the last
        /// [`AudioRingBuffer::begin_cycle`].
        notify: bool,
    },
}

/// Outbound PCM buffer with a reserved prefix.
#[derive(Debug)]
pub struct AudioRingBuffer {
    data: Vec<u8>,
    header_reserve: usize,
    cursor: usize,
    low_space_threshold: usize,
    overrun_reported: bool,
}

impl AudioRingBuffer {
    /// Creates an empty buffer of `capacity` bytes whose first
    /// `header_reserve` bytes are never filled with audio.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::ReserveTooLarge`] if `header_reserve >= capacity`.
    pub fn new(capacity: usize, header_reserve: usize) -> Result<Self, BufferError> {
        if header_reserve >= capacity {
            return Err(BufferError::ReserveTooLarge {
                reserve: header_reserve,
                capacity,
            });
        }
        Ok(Self {
            data: vec![0u8; capacity],
            header_reserve,
            cursor: header_reserve,
            low_space_threshold: 0,
            overrun_reported: false,
        })
    }

    /// Sets the free-space level below which [`is_low_on_space`](Self::is_low_on_space)
    /// reports `true`.
    pub fn with_low_space_threshold(mut self, threshold: usize) -> Self {
        self.low_space_threshold = threshold;
        self
    }

    /// Total size in bytes, including the header reserve.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn header_reserve(&self) -> usize {
        self.header_reserve
    }

    /// Current write position.  Always within `header_reserve..=capacity`.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes that can still be written before an overrun.
    pub fn space_available(&self) -> usize {
        self.capacity() - self.cursor
    }

    /// Bytes of audio waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.cursor - self.header_reserve
    }

    pub fn has_pending(&self) -> bool {
        self.cursor > self.header_reserve
    }

    pub fn is_low_on_space(&self) -> bool {
        self.space_available() < self.low_space_threshold
    }

    /// Copies `pcm` at the cursor, applying the full-reset overrun policy if
    /// it does not fit.
    pub fn write(&mut self, pcm: &[u8]) -> AudioWriteOutcome {
        if pcm.len() <= self.space_available() {
            self.data[self.cursor..self.cursor + pcm.len()].copy_from_slice(pcm);
            self.cursor += pcm.len();
            return AudioWriteOutcome::Written(pcm.len());
        }

        let mut dropped = self.pending_len();
        self.reset();

        let written = if pcm.len() <= self.space_available() {
            self.data[self.cursor..self.cursor + pcm.len()].copy_from_slice(pcm);
            self.cursor += pcm.len();
            pcm.len()
        } else {
            dropped += pcm.len();
            0
        };

        let notify = !self.overrun_reported;
        self.overrun_reported = true;
        AudioWriteOutcome::Overrun {
            dropped,
            written,
            notify,
        }
    }

    /// Writable region starting at the cursor, for producers that decode
    /// straight into the buffer.  Follow with [`advance`](Self::advance).
    pub fn write_slot(&mut self) -> &mut [u8] {
        let cursor = self.cursor;
        &mut self.data[cursor..]
    }

    /// Moves the cursor forward by `n` bytes after a [`write_slot`](Self::write_slot)
    /// copy.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Overflow`] if `n` exceeds the free space; the
    /// cursor is clamped to the capacity in that case.
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.space_available();
        if n > available {
            self.cursor = self.capacity();
            return Err(BufferError::Overflow {
                requested: n,
                available,
            });
        }
        self.cursor += n;
        Ok(())
    }

    /// Copies out the pending region and resets the cursor to the reserve.
    ///
    /// Returns `None` when nothing is pending.
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        if !self.has_pending() {
            return None;
        }
        let chunk = self.data[self.header_reserve..self.cursor].to_vec();
        self.reset();
        Some(chunk)
    }

    /// Drops all pending audio.
    pub fn reset(&mut self) {
        self.cursor = self.header_reserve;
    }

    /// Starts a new connect cycle: clears pending audio and re-arms the
    /// overrun notification.
    pub fn begin_cycle(&mut self) {
        self.reset();
        self.overrun_reported = false;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
