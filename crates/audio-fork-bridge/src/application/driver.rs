//! Per-connection task on the event-loop thread.
//!
//! One [`Driver`] runs for each connection from the moment the loop accepts
//! its connect request until a terminal event has been delivered.  It owns
//! the transport halves and the inbound reassembly buffer, and it is the only
//! code that moves the connection out of `Connecting`, `Connected` or
//! `Disconnecting` on its own.
//!
//! # Writable turns
//!
//! The handle side never writes to the network.  It marks work as pending and
//! the event loop wakes the driver through `ConnectionShared::writable`.  Each
//! wake-up is one writable turn, and one turn sends at most one frame:
//!
//! 1. a `BufferOverrun` notice, if the producer flagged one (no frame);
//! 2. else the oldest queued text frame, requesting another turn if text,
//!    audio or a close is still pending;
//! 3. else, while disconnecting, the close frame (pending audio is dropped);
//! 4. else all pending audio as one binary frame.
//!
//! # Termination
//!
//! | state when the socket ends | cause                      | final state  | event                       |
//! |----------------------------|----------------------------|--------------|-----------------------------|
//! | Connecting                 | open error / timeout       | Failed       | ConnectFail                 |
//! | Connected                  | remote close after finish  | Disconnected | ConnectionClosedGracefully  |
//! | Connected                  | remote close               | Disconnected | ConnectionDropped           |
//! | Connected                  | error / liveness timeout   | Failed       | ConnectionDropped           |
//! | Disconnecting              | any, or close timeout      | Disconnected | ConnectionClosedGracefully  |

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use audio_fork_core::{
    ConnectionState, EventKind, FragmentOutcome, FrameBuffer, InboundFragment, OutboundFrame,
    PayloadKind, ServiceConfig,
};

use super::connection::ConnectionShared;
use crate::infrastructure::transport::{
    FrameSink, FrameSource, Transport, TransportError, TransportEvent,
};

/// Timing knobs every driver of one service shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DriverSettings {
    pub keepalive: Option<Duration>,
    pub pong_timeout: Duration,
    pub close_timeout: Duration,
    pub connect_timeout: Duration,
}

impl From<&ServiceConfig> for DriverSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            keepalive: config.keepalive_interval,
            pong_timeout: config.pong_timeout,
            close_timeout: config.close_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// What a writable turn left behind.
#[derive(Debug, PartialEq, Eq)]
enum Turn {
    /// More work is pending; schedule another turn.
    More,
    Done,
}

/// Why the pump loop ended.
#[derive(Debug)]
enum Ending {
    RemoteClose { code: Option<u16> },
    Error(String),
    LivenessTimeout,
    CloseTimeout,
}

pub(crate) struct Driver {
    shared: Arc<ConnectionShared>,
    transport: Arc<dyn Transport>,
    settings: DriverSettings,
    frames: FrameBuffer,
    close_sent: bool,
    close_deadline: Option<Instant>,
    last_heard: Instant,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        transport: Arc<dyn Transport>,
        settings: DriverSettings,
    ) -> Self {
        let frames = FrameBuffer::new(shared.config.frame_limits());
        Self {
            shared,
            transport,
            settings,
            frames,
            close_sent: false,
            close_deadline: None,
            last_heard: Instant::now(),
        }
    }

    fn sid(&self) -> &str {
        self.shared.session_id()
    }

    /// Opens the connection and services it until it ends.
    pub(crate) async fn run(mut self) {
        let config = &self.shared.config;
        let url = config.url();
        let opened = tokio::time::timeout(
            self.settings.connect_timeout,
            self.transport.open(config),
        )
        .await;

        let pair = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return self.connect_failed(e),
            Err(_) => {
                return self.connect_failed(TransportError::ConnectTimeout {
                    url,
                    timeout: self.settings.connect_timeout,
                })
            }
        };

        if let Err(state) = self
            .shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
        {
            warn!("session {}: handshake finished while {state}; abandoning", self.sid());
            return;
        }
        info!("session {}: connected to {url}", self.sid());
        self.last_heard = Instant::now();
        self.shared.emit(EventKind::ConnectSuccess);

        if self.shared.close_after_connect.load(Ordering::SeqCst) {
            self.shared.begin_disconnect();
        }
        if self.shared.state.load() == ConnectionState::Disconnecting
            || self.shared.has_outbound_work()
        {
            self.shared.writable.notify_one();
        }

        let mut sink = pair.sink;
        let mut source = pair.source;
        let ending = self.pump(sink.as_mut(), source.as_mut()).await;
        self.terminate(ending);
    }

    fn connect_failed(&self, error: TransportError) {
        let reason = error.to_string();
        warn!("session {}: {reason}", self.sid());
        match self
            .shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Failed)
        {
            Ok(()) => self.shared.emit(EventKind::ConnectFail { reason }),
            Err(state) => debug!("session {}: connect failure ignored while {state}", self.sid()),
        }
    }

    async fn pump(&mut self, sink: &mut dyn FrameSink, source: &mut dyn FrameSource) -> Ending {
        let keepalive_period = self
            .shared
            .config
            .profile
            .keepalive_interval(self.settings.keepalive);
        let mut keepalive = keepalive_period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let shared = Arc::clone(&self.shared);

        loop {
            // Disabled branches still evaluate their future expression, so the
            // deadlines need a value even when unused.
            let close_deadline = self.close_deadline.unwrap_or_else(far_future);
            let liveness_deadline = self.last_heard + self.settings.pong_timeout;

            tokio::select! {
                _ = shared.writable.notified() => {
                    match self.on_writable(sink).await {
                        Ok(Turn::More) => shared.writable.notify_one(),
                        Ok(Turn::Done) => {}
                        Err(e) => return Ending::Error(e.to_string()),
                    }
                }
                event = source.next_event() => match event {
                    None => return Ending::Error("connection reset without close frame".into()),
                    Some(Err(e)) => return Ending::Error(e.to_string()),
                    Some(Ok(TransportEvent::Closed { code, reason })) => {
                        debug!("session {}: remote close {code:?} {reason:?}", self.sid());
                        return Ending::RemoteClose { code };
                    }
                    Some(Ok(TransportEvent::Heartbeat)) => self.last_heard = Instant::now(),
                    Some(Ok(TransportEvent::Fragment(fragment))) => {
                        self.last_heard = Instant::now();
                        self.on_fragment(fragment);
                    }
                },
                _ = tick(&mut keepalive), if keepalive.is_some() && !self.close_sent => {
                    debug!("session {}: keepalive ping", self.sid());
                    if let Err(e) = sink.send(OutboundFrame::Ping(Vec::new())).await {
                        return Ending::Error(e.to_string());
                    }
                }
                _ = sleep_until(liveness_deadline), if keepalive.is_some() => {
                    return Ending::LivenessTimeout;
                }
                _ = sleep_until(close_deadline), if self.close_deadline.is_some() => {
                    return Ending::CloseTimeout;
                }
            }
        }
    }

    /// One writable turn.  Sends at most one frame.
    async fn on_writable(&mut self, sink: &mut dyn FrameSink) -> Result<Turn, TransportError> {
        let state = self.shared.state.load();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) || self.close_sent
        {
            debug!("session {}: writable turn discarded while {state}", self.sid());
            return Ok(Turn::Done);
        }

        if state == ConnectionState::Connected
            && self.shared.overrun_notice.swap(false, Ordering::SeqCst)
        {
            self.shared.emit(EventKind::BufferOverrun);
        }

        let next_text = self.shared.outbox.lock().pop_front();
        if let Some(frame) = next_text {
            self.send_counted(sink, frame).await?;
            let more = !self.shared.outbox.lock().is_empty()
                || self.shared.audio.lock().has_pending()
                || self.shared.state.load() == ConnectionState::Disconnecting;
            return Ok(if more { Turn::More } else { Turn::Done });
        }

        if state == ConnectionState::Disconnecting {
            let dropped = {
                let mut audio = self.shared.audio.lock();
                let pending = audio.pending_len();
                audio.reset();
                pending
            };
            if dropped > 0 {
                debug!("session {}: dropping {dropped} bytes of audio on close", self.sid());
            }
            sink.send(OutboundFrame::Close).await?;
            self.close_sent = true;
            self.close_deadline = Some(Instant::now() + self.settings.close_timeout);
            debug!("session {}: close frame sent", self.sid());
            return Ok(Turn::Done);
        }

        let chunk = self.shared.audio.lock().take_pending();
        if let Some(chunk) = chunk {
            self.send_counted(sink, OutboundFrame::Binary(chunk)).await?;
        }
        Ok(Turn::Done)
    }

    async fn send_counted(
        &self,
        sink: &mut dyn FrameSink,
        frame: OutboundFrame,
    ) -> Result<(), TransportError> {
        let expected = frame.len();
        let kind = frame.kind_name();
        let written = sink.send(frame).await?;
        if written < expected {
            warn!(
                "session {}: short {kind} write ({written} of {expected} bytes)",
                self.sid()
            );
        }
        Ok(())
    }

    fn on_fragment(&mut self, fragment: InboundFragment) {
        if self.shared.state.load() == ConnectionState::Disconnecting {
            debug!("session {}: inbound data discarded while disconnecting", self.sid());
            self.frames.clear();
            return;
        }

        match self.frames.push(fragment) {
            FragmentOutcome::Incomplete => {}
            FragmentOutcome::Skipped => {
                debug!("session {}: skipped fragment of a dropped message", self.sid());
            }
            FragmentOutcome::Oversized { received } => warn!(
                "session {}: inbound message larger than {} bytes ({received} received); dropped",
                self.sid(),
                self.frames.limits().max_message_size
            ),
            FragmentOutcome::Complete(message) => match message.kind {
                PayloadKind::Text => match String::from_utf8(message.payload) {
                    Ok(text) => self.shared.emit(EventKind::Message(text)),
                    Err(e) => warn!("session {}: dropping non-UTF-8 text message: {e}", self.sid()),
                },
                PayloadKind::Binary if self.shared.config.profile.bidirectional_audio => {
                    self.shared.emit(EventKind::Binary(message.payload));
                }
                PayloadKind::Binary => debug!(
                    "session {}: discarding {} byte binary message",
                    self.sid(),
                    message.payload.len()
                ),
            },
        }
    }

    /// Applies the termination table and delivers the terminal event.
    fn terminate(&mut self, ending: Ending) {
        self.frames.clear();
        loop {
            let state = self.shared.state.load();
            let (next, event) = match (state, &ending) {
                (ConnectionState::Disconnecting, _) => (
                    ConnectionState::Disconnected,
                    EventKind::ConnectionClosedGracefully,
                ),
                (ConnectionState::Connected, Ending::RemoteClose { .. })
                    if self.shared.graceful.load(Ordering::SeqCst) =>
                {
                    (
                        ConnectionState::Disconnected,
                        EventKind::ConnectionClosedGracefully,
                    )
                }
                (ConnectionState::Connected, Ending::RemoteClose { .. }) => {
                    (ConnectionState::Disconnected, EventKind::ConnectionDropped)
                }
                (ConnectionState::Connected, _) => {
                    (ConnectionState::Failed, EventKind::ConnectionDropped)
                }
                (other, _) => {
                    debug!("session {}: connection ended while {other}", self.sid());
                    return;
                }
            };

            // A caller may move Connected → Disconnecting concurrently; retry
            // against the new state.
            if self.shared.state.transition(state, next).is_ok() {
                match &ending {
                    Ending::Error(reason) => {
                        warn!("session {}: connection lost: {reason}", self.sid())
                    }
                    Ending::LivenessTimeout => warn!(
                        "session {}: nothing heard for {:?}; dropping",
                        self.sid(),
                        self.settings.pong_timeout
                    ),
                    Ending::CloseTimeout => warn!(
                        "session {}: no close reply within {:?}",
                        self.sid(),
                        self.settings.close_timeout
                    ),
                    Ending::RemoteClose { code } => {
                        debug!("session {}: closed by remote ({code:?})", self.sid())
                    }
                }
                info!("session {}: {}", self.sid(), event.name());
                self.shared.emit(event);
                return;
            }
        }
    }
}

impl Drop for Driver {
    // Runs on normal exit and when shutdown drops the task mid-flight.
    fn drop(&mut self) {
        self.shared.abandon_waiters();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockTransport as ScriptedTransport;
    use crate::infrastructure::transport::MockTransport;
    use audio_fork_core::{BridgeEvent, ConnectionConfig, NotifyCallback, VendorProfile};
    use parking_lot::Mutex;

    type Events = Arc<Mutex<Vec<EventKind>>>;

    fn settings() -> DriverSettings {
        DriverSettings {
            keepalive: None,
            pong_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn connecting(config: ConnectionConfig) -> (Arc<ConnectionShared>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: NotifyCallback = Arc::new(move |e: BridgeEvent| sink.lock().push(e.kind));
        let shared = Arc::new(ConnectionShared::new(config, callback).unwrap());
        shared
            .state
            .transition(ConnectionState::Idle, ConnectionState::Connecting)
            .unwrap();
        (shared, events)
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("drv-1", "localhost", 9000, "/").with_tls(false)
    }

    #[tokio::test]
    async fn test_open_error_fails_connection_with_reason() {
        // Arrange
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|config| {
            Err(TransportError::Connect {
                url: config.url(),
                reason: "connection refused".into(),
            })
        });
        let (shared, events) = connecting(config());

        // Act
        Driver::new(Arc::clone(&shared), Arc::new(transport), settings())
            .run()
            .await;

        // Assert
        assert_eq!(shared.state.load(), ConnectionState::Failed);
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            EventKind::ConnectFail { reason } if reason.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_open_receives_connection_config() {
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .withf(|config| config.session_id == "drv-1" && config.port == 9000)
            .times(1)
            .returning(|_| {
                Err(TransportError::InvalidRequest("stop here".into()))
            });
        let (shared, _) = connecting(config());

        Driver::new(shared, Arc::new(transport), settings()).run().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handshake_times_out() {
        // Arrange
        let transport = ScriptedTransport::new();
        transport.set_connect_delay(Duration::from_secs(30));
        let (shared, events) = connecting(config());

        // Act
        Driver::new(Arc::clone(&shared), Arc::new(transport), settings())
            .run()
            .await;

        // Assert
        assert_eq!(shared.state.load(), ConnectionState::Failed);
        assert!(matches!(
            &events.lock()[0],
            EventKind::ConnectFail { reason } if reason.contains("timed out")
        ));
    }

    #[tokio::test]
    async fn test_remote_close_without_finish_is_a_drop() {
        // Arrange
        let transport = ScriptedTransport::new();
        let (shared, events) = connecting(config());
        let task = tokio::spawn(
            Driver::new(Arc::clone(&shared), Arc::new(transport.clone()), settings()).run(),
        );
        let peer = loop {
            if let Some(peer) = transport.peer("drv-1", Duration::ZERO) {
                break peer;
            }
            tokio::task::yield_now().await;
        };

        // Act
        peer.push_text("{\"transcript\":\"hi\"}");
        peer.close_remote(1000);
        task.await.unwrap();

        // Assert
        assert_eq!(shared.state.load(), ConnectionState::Disconnected);
        assert_eq!(
            *events.lock(),
            vec![
                EventKind::ConnectSuccess,
                EventKind::Message("{\"transcript\":\"hi\"}".into()),
                EventKind::ConnectionDropped,
            ]
        );
    }

    #[tokio::test]
    async fn test_binary_is_delivered_only_for_bidirectional_profiles() {
        for (profile, expect_binary) in [
            (VendorProfile::plain(), false),
            (VendorProfile::keepalive(0), true),
        ] {
            // Arrange
            let transport = ScriptedTransport::new();
            let (shared, events) = connecting(config().with_profile(profile));
            let task = tokio::spawn(
                Driver::new(Arc::clone(&shared), Arc::new(transport.clone()), settings()).run(),
            );
            let peer = loop {
                if let Some(peer) = transport.peer("drv-1", Duration::ZERO) {
                    break peer;
                }
                tokio::task::yield_now().await;
            };

            // Act
            peer.push_binary(&[1, 2, 3]);
            peer.fail("reset");
            task.await.unwrap();

            // Assert
            let got_binary = events
                .lock()
                .iter()
                .any(|e| matches!(e, EventKind::Binary(b) if b == &[1, 2, 3]));
            assert_eq!(got_binary, expect_binary);
            assert_eq!(shared.state.load(), ConnectionState::Failed);
        }
    }

    #[tokio::test]
    async fn test_text_turn_requests_another_turn_when_audio_pending() {
        // Arrange
        let transport = ScriptedTransport::new();
        let (shared, _) = connecting(config());
        let mut pair = transport.open(&shared.config).await.unwrap();
        shared
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Connected)
            .unwrap();
        shared.outbox.lock().push_back(OutboundFrame::Text("start".into()));
        shared.audio.lock().write(&[9u8; 320]);
        let mut driver = Driver::new(Arc::clone(&shared), Arc::new(transport.clone()), settings());

        // Act
        let first = driver.on_writable(pair.sink.as_mut()).await.unwrap();
        let second = driver.on_writable(pair.sink.as_mut()).await.unwrap();

        // Assert
        let peer = transport.peer("drv-1", Duration::ZERO).unwrap();
        assert_eq!(first, Turn::More);
        assert_eq!(second, Turn::Done);
        assert_eq!(
            peer.drain_frames(),
            vec![
                OutboundFrame::Text("start".into()),
                OutboundFrame::Binary(vec![9u8; 320]),
            ]
        );
    }
}
