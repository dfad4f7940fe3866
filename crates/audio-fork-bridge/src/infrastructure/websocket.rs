//! WebSocket client transport built on `tokio-tungstenite`.
//!
//! Opens `ws://` or `wss://` connections (rustls with the webpki root store),
//! attaches the `Authorization` and `Sec-WebSocket-Protocol` headers from the
//! connection config, and splits the stream into a [`FrameSink`] and a
//! [`FrameSource`].
//!
//! # Message sizes
//!
//! tungstenite reassembles fragmented messages itself and fails the whole
//! connection when a message exceeds its own limit.  The limit handed to
//! tungstenite is therefore a multiple of the configured cap, and the driver's
//! [`FrameBuffer`](audio_fork_core::FrameBuffer) applies the real cap, so a
//! moderately oversized message is dropped while the connection survives.

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use audio_fork_core::{ConnectionConfig, InboundFragment, OutboundFrame, PayloadKind};

use super::transport::{
    FrameSink, FrameSource, Transport, TransportError, TransportEvent, TransportPair,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headroom multiplier between tungstenite's limit and the configured cap.
const TRANSPORT_SIZE_HEADROOM: usize = 8;

/// Production [`Transport`].
#[derive(Debug, Default)]
pub struct WebSocketTransport {
    _private: (),
}

impl WebSocketTransport {
    pub fn new() -> Self {
        // tokio-tungstenite's rustls backend needs a process-wide crypto
        // provider; a second install attempt is a no-op.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { _private: () }
    }
}

/// Builds the upgrade request for `config`.
fn build_request(
    config: &ConnectionConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
    let url = config.url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(format!("{url}: {e}")))?;

    if let Some(auth) = config.credentials.authorization_header() {
        let value = HeaderValue::from_str(&auth)
            .map_err(|_| TransportError::InvalidRequest("authorization header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    if let Some(protocol) = &config.profile.subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|_| TransportError::InvalidRequest(format!("subprotocol {protocol:?}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

fn ws_config(config: &ConnectionConfig) -> WebSocketConfig {
    let limit = config.max_message_size.saturating_mul(TRANSPORT_SIZE_HEADROOM);
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(limit);
    ws.max_frame_size = Some(limit);
    ws
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<TransportPair, TransportError> {
        let request = build_request(config)?;
        let url = config.url();

        // Nagle off: audio frames are small and latency-sensitive.
        let (stream, response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config(config)), true)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
        debug!(
            "session {}: upgrade to {url} answered with {}",
            config.session_id,
            response.status()
        );

        let (sink, source) = stream.split();
        Ok(TransportPair {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<usize, TransportError> {
        let len = frame.len();
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Binary(bytes) => Message::Binary(bytes),
            OutboundFrame::Ping(bytes) => Message::Ping(bytes),
            OutboundFrame::Close => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            })),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(len)
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    return Some(Ok(TransportEvent::Closed {
                        code: None,
                        reason: String::new(),
                    }))
                }
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };

            let event = match message {
                Message::Text(text) => TransportEvent::Fragment(InboundFragment::whole(
                    PayloadKind::Text,
                    text.into_bytes(),
                )),
                Message::Binary(bytes) => {
                    TransportEvent::Fragment(InboundFragment::whole(PayloadKind::Binary, bytes))
                }
                // tungstenite answers pings on its own
                Message::Ping(_) | Message::Pong(_) => TransportEvent::Heartbeat,
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    TransportEvent::Closed { code, reason }
                }
                Message::Frame(_) => continue,
            };
            return Some(Ok(event));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use audio_fork_core::{Credentials, VendorProfile};

    #[test]
    fn test_request_carries_bearer_authorization() {
        // Arrange
        let config = ConnectionConfig::new("c", "stt.example.com", 443, "/listen")
            .with_credentials(Credentials::Bearer {
                api_key: "secret".into(),
            });

        // Act
        let request = build_request(&config).unwrap();

        // Assert
        assert_eq!(request.uri().to_string(), "wss://stt.example.com:443/listen");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer secret");
        assert!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn test_request_carries_subprotocol() {
        let mut profile = VendorProfile::plain();
        profile.subprotocol = Some("audio.stream.v1".into());
        let config = ConnectionConfig::new("c", "localhost", 8080, "/")
            .with_tls(false)
            .with_profile(profile);

        let request = build_request(&config).unwrap();

        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "audio.stream.v1");
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_request_rejects_header_with_newline() {
        let config = ConnectionConfig::new("c", "localhost", 8080, "/").with_credentials(
            Credentials::Bearer {
                api_key: "bad\nkey".into(),
            },
        );

        let result = build_request(&config);

        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }

    #[test]
    fn test_ws_config_leaves_headroom_above_cap() {
        let config = ConnectionConfig::new("c", "h", 1, "/").with_max_message_size(1000);

        let ws = ws_config(&config);

        assert_eq!(ws.max_message_size, Some(8000));
    }

    #[tokio::test]
    async fn test_open_against_closed_port_fails_with_connect_error() {
        // Arrange: port 1 on loopback is never listening in CI
        let transport = WebSocketTransport::new();
        let config = ConnectionConfig::new("c", "127.0.0.1", 1, "/").with_tls(false);

        // Act
        let result = transport.open(&config).await;

        // Assert
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
