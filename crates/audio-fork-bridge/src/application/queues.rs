//! Cross-thread work queues feeding the event loop.
//!
//! Caller threads never touch a transport.  They append the connection to one
//! of three queues (connect, disconnect, write) and wake the loop.  The loop
//! drains all three on every wake-up and acts on the drained copies, so no
//! queue lock is held while a connection is being processed.
//!
//! # Wake-ups
//!
//! The wake primitive is a [`tokio::sync::Notify`].  `notify_one` stores a
//! permit when the loop is not currently waiting, so a request enqueued while
//! the loop is busy draining is picked up on its next `wait()` instead of
//! being lost.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::BridgeError;

/// Everything taken out of the queues in one drain.
#[derive(Debug)]
pub struct Drained<T> {
    pub connects: Vec<T>,
    pub disconnects: Vec<T>,
    pub writes: Vec<T>,
}

impl<T> Drained<T> {
    pub fn is_empty(&self) -> bool {
        self.connects.is_empty() && self.disconnects.is_empty() && self.writes.is_empty()
    }
}

/// The three pending-work queues plus the wake signal.
#[derive(Debug)]
pub struct PendingQueues<T> {
    connects: Mutex<Vec<T>>,
    disconnects: Mutex<Vec<T>>,
    writes: Mutex<Vec<T>>,
    wake: Notify,
    stopped: AtomicBool,
}

impl<T> PendingQueues<T> {
    pub fn new() -> Self {
        Self {
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn enqueue_connect(&self, item: T) -> Result<(), BridgeError> {
        self.enqueue(&self.connects, item)
    }

    pub fn enqueue_disconnect(&self, item: T) -> Result<(), BridgeError> {
        self.enqueue(&self.disconnects, item)
    }

    pub fn enqueue_write(&self, item: T) -> Result<(), BridgeError> {
        self.enqueue(&self.writes, item)
    }

    fn enqueue(&self, queue: &Mutex<Vec<T>>, item: T) -> Result<(), BridgeError> {
        if self.is_stopped() {
            return Err(BridgeError::ServiceStopped);
        }
        queue.lock().push(item);
        self.wake.notify_one();
        Ok(())
    }

    /// Takes the full contents of every queue.
    pub fn drain(&self) -> Drained<T> {
        Drained {
            connects: std::mem::take(&mut *self.connects.lock()),
            disconnects: std::mem::take(&mut *self.disconnects.lock()),
            writes: std::mem::take(&mut *self.writes.lock()),
        }
    }

    /// Resolves after the next wake-up (immediately if one is stored).
    pub async fn wait(&self) {
        self.wake.notified().await;
    }

    /// Refuses further work and wakes the loop so it can observe the flag.
    /// Returns whatever was still queued.
    pub fn stop(&self) -> Drained<T> {
        self.stopped.store(true, Ordering::SeqCst);
        let leftover = self.drain();
        self.wake.notify_one();
        leftover
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl<T> Default for PendingQueues<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
