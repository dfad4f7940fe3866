//! In-memory transport for tests.
//!
//! [`MockTransport`] hands out connections whose remote side is a
//! [`MockPeer`] owned by the test.  The peer sees every frame the bridge
//! sends and can push text, binary, fragmented messages, close frames and
//! transport errors back.
//!
//! Frames sent by the bridge arrive on a std channel so that plain
//! (non-async) test threads can wait for them with a timeout while the
//! bridge's event loop runs on its own thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc as tokio_mpsc;

use audio_fork_core::{ConnectionConfig, InboundFragment, OutboundFrame, PayloadKind};

use super::transport::{
    FrameSink, FrameSource, Transport, TransportError, TransportEvent, TransportPair,
};

type InboundItem = Result<TransportEvent, TransportError>;

struct MockShared {
    peers: Mutex<HashMap<String, MockPeer>>,
    peer_arrived: Condvar,
    refusal: Mutex<Option<String>>,
    connect_delay: Mutex<Option<Duration>>,
    auto_pong: AtomicBool,
    echo_close: AtomicBool,
    opened: AtomicUsize,
}

/// A [`Transport`] whose connections terminate in the test.
///
/// Cloning yields another handle to the same transport.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    /// Creates a transport that accepts every connection, answers pings and
    /// echoes close frames.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                peers: Mutex::new(HashMap::new()),
                peer_arrived: Condvar::new(),
                refusal: Mutex::new(None),
                connect_delay: Mutex::new(None),
                auto_pong: AtomicBool::new(true),
                echo_close: AtomicBool::new(true),
                opened: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes every subsequent `open` fail with `reason`.
    pub fn refuse_with(&self, reason: impl Into<String>) {
        *self.shared.refusal.lock() = Some(reason.into());
    }

    /// Delays every subsequent `open` by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = Some(delay);
    }

    /// Whether pings from the bridge are answered.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Whether a close frame from the bridge is answered with a close frame.
    pub fn set_echo_close(&self, enabled: bool) {
        self.shared.echo_close.store(enabled, Ordering::SeqCst);
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the connection of `session_id` to open and
    /// returns its remote end.
    pub fn peer(&self, session_id: &str, timeout: Duration) -> Option<MockPeer> {
        let deadline = Instant::now() + timeout;
        let mut peers = self.shared.peers.lock();
        loop {
            if let Some(peer) = peers.get(session_id) {
                return Some(peer.clone());
            }
            if self
                .shared
                .peer_arrived
                .wait_until(&mut peers, deadline)
                .timed_out()
            {
                return peers.get(session_id).cloned();
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<TransportPair, TransportError> {
        let delay = *self.shared.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let refusal = self.shared.refusal.lock().clone();
        if let Some(reason) = refusal {
            return Err(TransportError::Connect {
                url: config.url(),
                reason,
            });
        }

        let (frames_tx, frames_rx) = mpsc::channel();
        let (inbound_tx, inbound_rx) = tokio_mpsc::unbounded_channel();

        let peer = MockPeer {
            session_id: config.session_id.clone(),
            frames: Arc::new(Mutex::new(frames_rx)),
            inbound: inbound_tx.clone(),
        };
        self.shared
            .peers
            .lock()
            .insert(config.session_id.clone(), peer);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        self.shared.peer_arrived.notify_all();

        Ok(TransportPair {
            sink: Box::new(MockSink {
                frames: frames_tx,
                inbound: inbound_tx,
                shared: Arc::clone(&self.shared),
            }),
            source: Box::new(MockSource { inbound: inbound_rx }),
        })
    }
}

struct MockSink {
    frames: mpsc::Sender<OutboundFrame>,
    inbound: tokio_mpsc::UnboundedSender<InboundItem>,
    shared: Arc<MockShared>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<usize, TransportError> {
        let len = frame.len();
        match &frame {
            OutboundFrame::Ping(_) if self.shared.auto_pong.load(Ordering::SeqCst) => {
                let _ = self.inbound.send(Ok(TransportEvent::Heartbeat));
            }
            OutboundFrame::Close if self.shared.echo_close.load(Ordering::SeqCst) => {
                let _ = self.inbound.send(Ok(TransportEvent::Closed {
                    code: Some(1000),
                    reason: String::new(),
                }));
            }
            _ => {}
        }
        // The test may have dropped its peer; the bridge does not care.
        let _ = self.frames.send(frame);
        Ok(len)
    }
}

struct MockSource {
    inbound: tokio_mpsc::UnboundedReceiver<InboundItem>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_event(&mut self) -> Option<InboundItem> {
        self.inbound.recv().await
    }
}

/// The remote end of one mock connection.
#[derive(Clone)]
pub struct MockPeer {
    session_id: String,
    frames: Arc<Mutex<mpsc::Receiver<OutboundFrame>>>,
    inbound: tokio_mpsc::UnboundedSender<InboundItem>,
}

impl MockPeer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next frame the bridge sent, including pings.
    pub fn next_frame(&self, timeout: Duration) -> Option<OutboundFrame> {
        self.frames.lock().recv_timeout(timeout).ok()
    }

    /// Next frame the bridge sent, skipping keepalive pings.
    pub fn next_data_frame(&self, timeout: Duration) -> Option<OutboundFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_frame(left)? {
                OutboundFrame::Ping(_) => continue,
                frame => return Some(frame),
            }
        }
    }

    /// Collects frames until `stop` matches one (inclusive) or `timeout`
    /// passes.
    pub fn frames_until<F>(&self, timeout: Duration, stop: F) -> Vec<OutboundFrame>
    where
        F: Fn(&OutboundFrame) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while let Some(frame) =
            self.next_data_frame(deadline.saturating_duration_since(Instant::now()))
        {
            let done = stop(&frame);
            out.push(frame);
            if done {
                break;
            }
        }
        out
    }

    /// Frames that are already waiting, without blocking.
    pub fn drain_frames(&self) -> Vec<OutboundFrame> {
        self.frames.lock().try_iter().collect()
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(TransportEvent::Fragment(InboundFragment::text(text))));
    }

    pub fn push_binary(&self, bytes: &[u8]) {
        self.push(Ok(TransportEvent::Fragment(InboundFragment::whole(
            PayloadKind::Binary,
            bytes.to_vec(),
        ))));
    }

    /// Sends `payload` as one message split into `parts` fragments.
    pub fn push_fragmented(&self, kind: PayloadKind, payload: &[u8], parts: usize) {
        for fragment in InboundFragment::split(kind, payload, parts) {
            self.push(Ok(TransportEvent::Fragment(fragment)));
        }
    }

    pub fn push_fragment(&self, fragment: InboundFragment) {
        self.push(Ok(TransportEvent::Fragment(fragment)));
    }

    /// The remote sends a close frame.
    pub fn close_remote(&self, code: u16) {
        self.push(Ok(TransportEvent::Closed {
            code: Some(code),
            reason: String::new(),
        }));
    }

    /// The connection breaks with a transport error.
    pub fn fail(&self, reason: &str) {
        self.push(Err(TransportError::Receive(reason.to_string())));
    }

    fn push(&self, item: InboundItem) {
        let _ = self.inbound.send(item);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
