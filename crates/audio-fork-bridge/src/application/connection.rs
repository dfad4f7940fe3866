//! One call leg's connection, as seen from caller threads.
//!
//! A [`ConnectionHandle`] is what the call-handling layer holds.  It is cheap
//! to clone and safe to use from any thread.  All operations on it are
//! non-blocking: they lock a small per-connection buffer for O(1) work,
//! possibly append to a work queue, and return.  Anything that touches the
//! network happens later on the event-loop thread.
//!
//! # Shared state
//!
//! ```text
//!  caller threads                       event-loop thread
//!  ──────────────                       ─────────────────
//!  lock_audio_buffer() ──┐          ┌── driver: take_pending() → Binary
//!  buffer_for_sending() ─┼─► ConnectionShared ◄─┤   driver: pop outbox → Text
//!  close() / finish() ───┘          └── driver: state transitions, events
//! ```
//!
//! Each buffer sits behind its own [`parking_lot::Mutex`].  No lock is ever
//! held while a callback runs or while the transport is awaited.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use audio_fork_core::{
    AtomicConnectionState, AudioRingBuffer, AudioWriteOutcome, BridgeEvent, BufferError,
    ConnectionConfig, ConnectionState, EventKind, NotifyCallback, OutboundFrame, TerminalOutcome,
};

use super::queues::PendingQueues;
use crate::error::BridgeError;

/// Queue entries do not keep a connection alive.
pub(crate) type Queues = PendingQueues<Weak<ConnectionShared>>;

#[derive(Default)]
struct Completion {
    outcome: Option<TerminalOutcome>,
    waiters: Vec<oneshot::Sender<TerminalOutcome>>,
}

/// State shared between the handle, the work queues and the driver task.
pub(crate) struct ConnectionShared {
    pub(crate) config: ConnectionConfig,
    pub(crate) state: AtomicConnectionState,
    pub(crate) audio: Mutex<AudioRingBuffer>,
    pub(crate) outbox: Mutex<VecDeque<OutboundFrame>>,
    /// Set by the producer on the first overrun of a cycle; the driver turns
    /// it into one `BufferOverrun` event.
    pub(crate) overrun_notice: AtomicBool,
    /// The connection is already in the write queue.
    pub(crate) write_queued: AtomicBool,
    /// `finish()` was called; a remote close now counts as graceful.
    pub(crate) graceful: AtomicBool,
    /// `connect()` was accepted; the loop may not have picked it up yet.
    pub(crate) connect_requested: AtomicBool,
    /// `close()` arrived before the handshake finished.
    pub(crate) close_after_connect: AtomicBool,
    /// Wakes the driver for a writable turn.
    pub(crate) writable: Notify,
    callback: NotifyCallback,
    completion: Mutex<Completion>,
}

impl ConnectionShared {
    pub(crate) fn new(
        config: ConnectionConfig,
        callback: NotifyCallback,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let audio = AudioRingBuffer::new(config.audio_capacity, config.header_reserve)?
            .with_low_space_threshold(config.low_space_threshold);
        Ok(Self {
            config,
            state: AtomicConnectionState::new(ConnectionState::Idle),
            audio: Mutex::new(audio),
            outbox: Mutex::new(VecDeque::new()),
            overrun_notice: AtomicBool::new(false),
            write_queued: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            connect_requested: AtomicBool::new(false),
            close_after_connect: AtomicBool::new(false),
            writable: Notify::new(),
            callback,
            completion: Mutex::new(Completion::default()),
        })
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.config.session_id
    }

    /// Text, audio or a pending close is waiting for a writable turn.
    pub(crate) fn has_outbound_work(&self) -> bool {
        !self.outbox.lock().is_empty()
            || self.audio.lock().has_pending()
            || self.overrun_notice.load(Ordering::SeqCst)
    }

    /// Delivers one event to the notify callback.
    ///
    /// At most one terminal event is delivered; anything emitted after it is
    /// dropped.  A panicking callback is caught and logged here so it never
    /// unwinds into the event loop.
    pub(crate) fn emit(&self, kind: EventKind) {
        let outcome = kind.terminal_outcome();
        {
            let mut completion = self.completion.lock();
            if completion.outcome.is_some() {
                debug!(
                    "session {}: dropping {} event after terminal event",
                    self.session_id(),
                    kind.name()
                );
                return;
            }
            if outcome.is_some() {
                completion.outcome = outcome;
            }
        }

        let name = kind.name();
        let event = BridgeEvent {
            session_id: self.config.session_id.clone(),
            tag: self.config.profile.tag.clone(),
            kind,
        };
        if catch_unwind(AssertUnwindSafe(|| (self.callback)(event))).is_err() {
            error!(
                "session {}: notify callback panicked while handling {name}",
                self.session_id()
            );
        }

        if let Some(outcome) = outcome {
            let waiters = std::mem::take(&mut self.completion.lock().waiters);
            for waiter in waiters {
                let _ = waiter.send(outcome);
            }
        }
    }

    /// Returns a receiver that resolves with the terminal outcome.
    fn subscribe_completion(&self) -> oneshot::Receiver<TerminalOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut completion = self.completion.lock();
        match completion.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => completion.waiters.push(tx),
        }
        rx
    }

    /// Drops pending completion waiters so they observe that no terminal
    /// event will ever come.
    pub(crate) fn abandon_waiters(&self) {
        let waiters = std::mem::take(&mut self.completion.lock().waiters);
        if !waiters.is_empty() {
            debug!(
                "session {}: releasing {} close waiter(s) without an outcome",
                self.session_id(),
                waiters.len()
            );
        }
    }

    /// Starts a connect cycle.  Re-arms the overrun notification and drops
    /// any notice raised before the cycle began.
    pub(crate) fn begin_cycle(&self) {
        self.audio.lock().begin_cycle();
        self.overrun_notice.store(false, Ordering::SeqCst);
    }

    /// Connected → Disconnecting.  Returns `true` if this call made the move.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let moved = self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
            .is_ok();
        if moved {
            info!("session {}: closing", self.session_id());
        }
        moved
    }
}

/// Caller-side handle to one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    queues: Arc<Queues>,
}

impl ConnectionHandle {
    pub(crate) fn new(shared: Arc<ConnectionShared>, queues: Arc<Queues>) -> Self {
        Self { shared, queues }
    }

    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn invalid(&self, operation: &'static str) -> BridgeError {
        BridgeError::InvalidState {
            session_id: self.session_id().to_string(),
            operation,
            state: self.state(),
        }
    }

    /// Requests that the event loop open the connection.
    ///
    /// The outcome arrives as `ConnectSuccess` or `ConnectFail` on the
    /// callback.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] unless the connection is `Idle`;
    /// [`BridgeError::ServiceStopped`] after shutdown.
    pub fn connect(&self) -> Result<(), BridgeError> {
        if self.state() != ConnectionState::Idle {
            return Err(self.invalid("connect"));
        }
        self.shared.connect_requested.store(true, Ordering::SeqCst);
        let result = self.queues.enqueue_connect(Arc::downgrade(&self.shared));
        if result.is_err() {
            self.shared.connect_requested.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Starts a graceful close: queued text is flushed, pending audio is
    /// dropped, then a close frame is sent.
    ///
    /// Closing after `connect()` but before the handshake finished takes
    /// effect as soon as the connection is established.  Closing a
    /// connection that is already closing or closed does nothing.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] on a connection that `connect()` was
    /// never called on; [`BridgeError::ServiceStopped`] after shutdown.
    pub fn close(&self) -> Result<(), BridgeError> {
        loop {
            match self.state() {
                ConnectionState::Idle
                    if !self.shared.connect_requested.load(Ordering::SeqCst) =>
                {
                    return Err(self.invalid("close"))
                }
                ConnectionState::Connected => {
                    if self.shared.begin_disconnect() {
                        return self.queues.enqueue_disconnect(Arc::downgrade(&self.shared));
                    }
                }
                ConnectionState::Idle | ConnectionState::Connecting => {
                    self.shared.close_after_connect.store(true, Ordering::SeqCst);
                    // The driver checks the flag right after it reaches
                    // Connected; re-read to catch the case where it already did.
                    if matches!(
                        self.state(),
                        ConnectionState::Idle | ConnectionState::Connecting
                    ) {
                        debug!(
                            "session {}: close deferred until the handshake completes",
                            self.session_id()
                        );
                        return Ok(());
                    }
                }
                ConnectionState::Disconnecting
                | ConnectionState::Disconnected
                | ConnectionState::Failed => return Ok(()),
            }
        }
    }

    /// Like [`close`](Self::close) but also returns a [`CloseCompletion`]
    /// that resolves with the terminal outcome.
    pub fn close_with_completion(&self) -> Result<CloseCompletion, BridgeError> {
        let rx = self.shared.subscribe_completion();
        self.close()?;
        Ok(CloseCompletion { rx })
    }

    /// Tells the remote service that no more audio follows, using the vendor
    /// profile's finish signal.  The connection stays open until the remote
    /// closes it; that close is then reported as graceful.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] unless the connection is `Connected`.
    pub fn finish(&self) -> Result<(), BridgeError> {
        if self.state() != ConnectionState::Connected {
            return Err(self.invalid("finish"));
        }
        self.shared.graceful.store(true, Ordering::SeqCst);
        self.shared
            .outbox
            .lock()
            .push_back(self.shared.config.profile.finish.to_frame());
        self.request_write()
    }

    /// Queues a text control message.  Text is always sent before any audio
    /// pending at the same writable turn.
    ///
    /// Allowed before `connect()`, so a vendor start message can be queued
    /// ahead of the handshake.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] once the connection is closing or
    /// closed.
    pub fn buffer_for_sending(&self, text: impl Into<String>) -> Result<(), BridgeError> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Disconnecting | ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            return Err(self.invalid("queue text"));
        }
        self.shared
            .outbox
            .lock()
            .push_back(OutboundFrame::Text(text.into()));
        // The handshake may have completed since the check above, after the
        // driver looked for queued work.
        if self.state() == ConnectionState::Connected {
            self.request_write()?;
        }
        Ok(())
    }

    /// Locks the outbound audio buffer for the producer.
    ///
    /// The lock is released when the guard drops; if audio is then pending on
    /// a connected connection, a write is requested.
    pub fn lock_audio_buffer(&self) -> AudioWriteGuard<'_> {
        AudioWriteGuard {
            buffer: self.shared.audio.lock(),
            handle: self,
        }
    }

    pub fn space_available(&self) -> usize {
        self.shared.audio.lock().space_available()
    }

    pub fn is_low_on_space(&self) -> bool {
        self.shared.audio.lock().is_low_on_space()
    }

    fn request_write(&self) -> Result<(), BridgeError> {
        if self.shared.write_queued.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.queues.enqueue_write(Arc::downgrade(&self.shared));
        if result.is_err() {
            self.shared.write_queued.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive access to the outbound audio buffer.
///
/// Dereferences to [`AudioRingBuffer`] for reads; writes should go through
/// [`write`](Self::write) so overruns are reported.
pub struct AudioWriteGuard<'a> {
    buffer: MutexGuard<'a, AudioRingBuffer>,
    handle: &'a ConnectionHandle,
}

impl AudioWriteGuard<'_> {
    /// Appends PCM.  On the first overrun of a cycle a `BufferOverrun` event
    /// is scheduled.
    pub fn write(&mut self, pcm: &[u8]) -> AudioWriteOutcome {
        let outcome = self.buffer.write(pcm);
        if let AudioWriteOutcome::Overrun {
            dropped, notify, ..
        } = outcome
        {
            if notify {
                warn!(
                    "session {}: audio buffer overrun; dropped {dropped} bytes",
                    self.handle.session_id()
                );
                self.handle
                    .shared
                    .overrun_notice
                    .store(true, Ordering::SeqCst);
            } else {
                debug!(
                    "session {}: audio buffer overrun; dropped {dropped} bytes",
                    self.handle.session_id()
                );
            }
        }
        outcome
    }

    /// Commits `n` bytes written through [`AudioRingBuffer::write_slot`].
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        self.buffer.advance(n)
    }
}

impl Deref for AudioWriteGuard<'_> {
    type Target = AudioRingBuffer;

    fn deref(&self) -> &AudioRingBuffer {
        &self.buffer
    }
}

impl DerefMut for AudioWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut AudioRingBuffer {
        &mut self.buffer
    }
}

impl Drop for AudioWriteGuard<'_> {
    // Runs before the mutex guard field is released.  Requesting a write only
    // touches the write queue, never the audio lock.
    fn drop(&mut self) {
        let pending = self.buffer.has_pending();
        let overrun = self.handle.shared.overrun_notice.load(Ordering::SeqCst);
        if (pending || overrun) && self.handle.is_connected() {
            if let Err(e) = self.handle.request_write() {
                debug!(
                    "session {}: audio write not scheduled: {e}",
                    self.handle.session_id()
                );
            }
        }
    }
}

/// Resolves once the connection reaches a terminal state.
#[derive(Debug)]
pub struct CloseCompletion {
    rx: oneshot::Receiver<TerminalOutcome>,
}

impl CloseCompletion {
    /// Waits from async code.  `None` if the service stopped before the
    /// connection finished.
    pub async fn wait_async(self) -> Option<TerminalOutcome> {
        self.rx.await.ok()
    }

    /// Waits from a plain thread.  Must not be called from inside an async
    /// runtime.
    pub fn wait_blocking(self) -> Option<TerminalOutcome> {
        self.rx.blocking_recv().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
