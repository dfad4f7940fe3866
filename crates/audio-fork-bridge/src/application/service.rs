//! The event-loop service.
//!
//! [`BridgeService`] owns one OS thread named `audio-fork-loop`.  That thread
//! runs a current-thread tokio runtime, and every transport operation, timer
//! and state transition of every connection happens on it.
//!
//! # Loop
//!
//! ```text
//! loop {
//!     wait for a wake-up
//!     if stopping: break
//!     drain queues
//!     connects:    Idle → Connecting, reset the audio cycle, spawn a driver
//!     disconnects: still Disconnecting → give the driver a writable turn
//!     writes:      still Connected    → give the driver a writable turn
//! }
//! ```
//!
//! Queue entries are weak: a connection whose handles were all dropped before
//! its request was drained is skipped.  Requests whose connection has moved on
//! by the time they are drained are discarded with a debug log.
//!
//! # Startup and shutdown
//!
//! The runtime is built on the caller's thread before the loop thread is
//! spawned, so both failure modes surface synchronously from
//! [`BridgeService::initialize`].  [`BridgeService::shutdown`] (or dropping the
//! service) stops the loop and joins the thread.  Connections still open at
//! that point are abandoned without events: the call-handling layer is
//! expected to close them first.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use audio_fork_core::{ConnectionConfig, ConnectionState, NotifyCallback, ServiceConfig};

use super::connection::{ConnectionHandle, ConnectionShared, Queues};
use super::driver::{Driver, DriverSettings};
use crate::error::BridgeError;
use crate::infrastructure::transport::Transport;
use crate::infrastructure::websocket::WebSocketTransport;
use crate::logging;

const LOOP_THREAD_NAME: &str = "audio-fork-loop";

/// Process-wide bridge: one event-loop thread serving many connections.
pub struct BridgeService {
    config: ServiceConfig,
    queues: Arc<Queues>,
    thread: Option<JoinHandle<()>>,
}

impl BridgeService {
    /// Starts the event loop with the given transport.
    ///
    /// If `config.log_level` is set, a `tracing` subscriber is installed
    /// unless one already exists.
    ///
    /// # Errors
    ///
    /// [`BridgeError::RuntimeInit`] or [`BridgeError::ThreadSpawn`].
    pub fn initialize(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        if let Some(level) = &config.log_level {
            logging::init(level);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BridgeError::RuntimeInit)?;

        let queues = Arc::new(Queues::new());
        let loop_queues = Arc::clone(&queues);
        let settings = DriverSettings::from(&config);

        let thread = std::thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(event_loop(loop_queues, transport, settings));
                // Dropping the runtime here cancels every driver still running.
            })
            .map_err(BridgeError::ThreadSpawn)?;

        info!(
            "bridge service started (keepalive {:?}, connect timeout {:?})",
            config.keepalive_interval, config.connect_timeout
        );
        Ok(Self {
            config,
            queues,
            thread: Some(thread),
        })
    }

    /// Starts the event loop with the WebSocket transport.
    pub fn initialize_websocket(config: ServiceConfig) -> Result<Self, BridgeError> {
        Self::initialize(config, Arc::new(WebSocketTransport::new()))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Creates an idle connection.  Nothing touches the network until
    /// [`ConnectionHandle::connect`] is called.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] or [`BridgeError::Buffer`] for a bad config;
    /// [`BridgeError::ServiceStopped`] after shutdown.
    pub fn create_connection(
        &self,
        config: ConnectionConfig,
        callback: NotifyCallback,
    ) -> Result<ConnectionHandle, BridgeError> {
        if self.queues.is_stopped() {
            return Err(BridgeError::ServiceStopped);
        }
        let shared = Arc::new(ConnectionShared::new(config, callback)?);
        debug!("session {}: created", shared.session_id());
        Ok(ConnectionHandle::new(shared, Arc::clone(&self.queues)))
    }

    /// Stops the event loop and joins its thread.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ThreadPanicked`] if the loop thread panicked.
    pub fn shutdown(mut self) -> Result<(), BridgeError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), BridgeError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // Connects the loop never picked up will not produce an outcome.
        for conn in self.queues.stop().connects.iter().filter_map(Weak::upgrade) {
            conn.abandon_waiters();
        }
        let joined = thread.join().map_err(|_| BridgeError::ThreadPanicked);
        info!("bridge service stopped");
        joined
    }
}

impl Drop for BridgeService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("bridge service shutdown: {e}");
        }
    }
}

async fn event_loop(queues: Arc<Queues>, transport: Arc<dyn Transport>, settings: DriverSettings) {
    debug!("event loop running");
    loop {
        queues.wait().await;
        if queues.is_stopped() {
            break;
        }
        let batch = queues.drain();

        for conn in batch.connects.iter().filter_map(Weak::upgrade) {
            match conn
                .state
                .transition(ConnectionState::Idle, ConnectionState::Connecting)
            {
                Ok(()) => {
                    conn.begin_cycle();
                    info!("session {}: connecting to {}", conn.session_id(), conn.config.url());
                    let driver = Driver::new(conn, Arc::clone(&transport), settings.clone());
                    tokio::spawn(driver.run());
                }
                Err(state) => debug!(
                    "session {}: connect request discarded while {state}",
                    conn.session_id()
                ),
            }
        }

        for conn in batch.disconnects.iter().filter_map(Weak::upgrade) {
            match conn.state.load() {
                ConnectionState::Disconnecting => conn.writable.notify_one(),
                state => debug!(
                    "session {}: disconnect request discarded while {state}",
                    conn.session_id()
                ),
            }
        }

        for conn in batch.writes.iter().filter_map(Weak::upgrade) {
            conn.write_queued
                .store(false, std::sync::atomic::Ordering::SeqCst);
            match conn.state.load() {
                ConnectionState::Connected => conn.writable.notify_one(),
                state => debug!(
                    "session {}: write request discarded while {state}",
                    conn.session_id()
                ),
            }
        }
    }
    debug!("event loop exiting");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockTransport;
    use audio_fork_core::{BridgeEvent, EventKind};
    use std::sync::mpsc;
    use std::time::Duration;

    fn quiet_config() -> ServiceConfig {
        ServiceConfig {
            keepalive_interval: None,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_initialize_and_shutdown() {
        let service = BridgeService::initialize(quiet_config(), Arc::new(MockTransport::new()))
            .unwrap();
        assert!(service.shutdown().is_ok());
    }

    #[test]
    fn test_connect_round_trip_through_loop_thread() {
        // Arrange
        let transport = MockTransport::new();
        let service =
            BridgeService::initialize(quiet_config(), Arc::new(transport.clone())).unwrap();
        let (tx, rx) = mpsc::channel();
        let callback: NotifyCallback = Arc::new(move |e: BridgeEvent| {
            let thread = std::thread::current().name().map(str::to_string);
            let _ = tx.send((e.kind, thread));
        });
        let handle = service
            .create_connection(
                ConnectionConfig::new("svc-1", "mock", 1, "/").with_tls(false),
                callback,
            )
            .unwrap();

        // Act
        handle.connect().unwrap();

        // Assert: the event arrives on the loop thread
        let (kind, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, EventKind::ConnectSuccess);
        assert_eq!(thread.as_deref(), Some(LOOP_THREAD_NAME));
        assert!(handle.is_connected());
        service.shutdown().unwrap();
    }

    #[test]
    fn test_create_connection_rejects_bad_config() {
        let service =
            BridgeService::initialize(quiet_config(), Arc::new(MockTransport::new())).unwrap();
        let callback: NotifyCallback = Arc::new(|_: BridgeEvent| {});

        let result = service.create_connection(
            ConnectionConfig::new("svc-2", "mock", 1, "/").with_audio_buffer(16, 16),
            callback,
        );

        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
