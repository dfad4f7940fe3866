//! Connection and service configuration.
//!
//! [`ConnectionConfig`] describes one call leg's target and buffers.  It is
//! immutable once a connection is created.  [`ServiceConfig`] holds the
//! process-wide settings read once when the event-loop service starts.
//!
//! Both types carry sensible defaults so that a caller only needs a session
//! id and a host.  `ConnectionConfig` (with its credentials and vendor
//! profile) also deserializes with `serde`, using the same defaults for any
//! field absent from the input:
//!
//! ```toml
//! session_id = "call-1234"
//! host = "stt.example.com"
//! path = "/v1/stream"
//! use_tls = true
//!
//! [credentials]
//! type = "bearer"
//! api_key = "..."
//!
//! [profile]
//! tag = "audio_fork"
//! bidirectional_audio = false
//! finish = { text = "{\"type\":\"stop\"}" }
//! ```

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::frame::{FrameLimits, DEFAULT_GROWTH_INCREMENT, DEFAULT_MAX_MESSAGE_SIZE};
use crate::domain::frames::OutboundFrame;

/// Environment variable: keepalive ping interval in seconds (0 disables).
pub const ENV_KEEPALIVE_SECS: &str = "AUDIO_FORK_KEEPALIVE_SECS";
/// Environment variable: seconds without any inbound traffic before a
/// connection is considered dead.
pub const ENV_PONG_TIMEOUT_SECS: &str = "AUDIO_FORK_PONG_TIMEOUT_SECS";
/// Environment variable: seconds to wait for the remote close reply.
pub const ENV_CLOSE_TIMEOUT_SECS: &str = "AUDIO_FORK_CLOSE_TIMEOUT_SECS";
/// Environment variable: seconds allowed for TCP + TLS + WebSocket handshake.
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "AUDIO_FORK_CONNECT_TIMEOUT_SECS";
/// Environment variable: `tracing` filter directive for the bridge.
pub const ENV_LOG: &str = "AUDIO_FORK_LOG";

/// Default outbound audio buffer: one second of 16 kHz mono PCM16.
pub const DEFAULT_AUDIO_CAPACITY: usize = 32_000;
/// Default reserved prefix in front of the audio payload.
pub const DEFAULT_HEADER_RESERVE: usize = 16;
/// Default free-space level that counts as "low".
pub const DEFAULT_LOW_SPACE_THRESHOLD: usize = 3_200;

/// Errors produced while validating or loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),

    #[error("path must start with '/': {0:?}")]
    InvalidPath(String),

    #[error("header reserve {reserve} must be smaller than audio capacity {capacity}")]
    ReserveTooLarge { reserve: usize, capacity: usize },

    #[error("max_message_size must be greater than zero")]
    ZeroMessageSize,

    #[error("environment variable {name} has invalid value {value:?}; expected whole seconds")]
    InvalidEnv { name: &'static str, value: String },
}

// ── Credentials ───────────────────────────────────────────────────────────────

/// Authentication sent with the WebSocket upgrade request.
///
/// Basic and bearer authentication are mutually exclusive per deployment.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        api_key: String,
    },
}

impl Credentials {
    /// Value for the `Authorization` header, if any.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{username}:{password}"))
            )),
            Self::Bearer { api_key } => Some(format!("Bearer {api_key}")),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

// ── Vendor profile ────────────────────────────────────────────────────────────

/// How `finish()` tells the remote service that no more audio will follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishSignal {
    /// A final text control message.
    Text(String),
    /// A zero-length binary frame.
    EmptyBinary,
}

impl FinishSignal {
    pub fn to_frame(&self) -> OutboundFrame {
        match self {
            Self::Text(text) => OutboundFrame::Text(text.clone()),
            Self::EmptyBinary => OutboundFrame::Binary(Vec::new()),
        }
    }
}

impl Default for FinishSignal {
    fn default() -> Self {
        Self::Text("stop".to_string())
    }
}

/// Vendor-specific knobs layered over the one generic connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorProfile {
    /// Logical tag attached to every event.
    pub tag: String,
    /// Deliver inbound binary frames as `Binary` events instead of
    /// discarding them.
    pub bidirectional_audio: bool,
    /// Overrides the service keepalive interval (seconds, 0 disables).
    pub keepalive_secs: Option<u64>,
    pub finish: FinishSignal,
    /// Value for `Sec-WebSocket-Protocol`.
    pub subprotocol: Option<String>,
}

impl VendorProfile {
    /// Audio out, JSON in; service-wide keepalive.
    pub fn plain() -> Self {
        Self {
            tag: "audio_fork".to_string(),
            bidirectional_audio: false,
            keepalive_secs: None,
            finish: FinishSignal::default(),
            subprotocol: None,
        }
    }

    /// Services that hang up on idle sockets: pings every `secs` seconds and
    /// accepts synthesized audio back.
    pub fn keepalive(secs: u64) -> Self {
        Self {
            tag: "audio_fork_keepalive".to_string(),
            bidirectional_audio: true,
            keepalive_secs: Some(secs),
            ..Self::plain()
        }
    }

    /// The keepalive interval for this profile given the service default.
    /// `None` means keepalive is disabled.
    pub fn keepalive_interval(&self, service_default: Option<Duration>) -> Option<Duration> {
        match self.keepalive_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => service_default,
        }
    }
}

impl Default for VendorProfile {
    fn default() -> Self {
        Self::plain()
    }
}

// ── Connection config ─────────────────────────────────────────────────────────

/// Everything needed to open one call leg's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub session_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_audio_capacity")]
    pub audio_capacity: usize,
    #[serde(default = "default_header_reserve")]
    pub header_reserve: usize,
    #[serde(default = "default_low_space_threshold")]
    pub low_space_threshold: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub profile: VendorProfile,
}

fn default_port() -> u16 {
    443
}
fn default_path() -> String {
    "/".to_string()
}
fn default_true() -> bool {
    true
}
fn default_audio_capacity() -> usize {
    DEFAULT_AUDIO_CAPACITY
}
fn default_header_reserve() -> usize {
    DEFAULT_HEADER_RESERVE
}
fn default_low_space_threshold() -> usize {
    DEFAULT_LOW_SPACE_THRESHOLD
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl ConnectionConfig {
    /// A config with defaults for everything except the identity and target.
    pub fn new(
        session_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            host: host.into(),
            port,
            path: path.into(),
            use_tls: true,
            audio_capacity: DEFAULT_AUDIO_CAPACITY,
            header_reserve: DEFAULT_HEADER_RESERVE,
            low_space_threshold: DEFAULT_LOW_SPACE_THRESHOLD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            credentials: Credentials::None,
            profile: VendorProfile::plain(),
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_audio_buffer(mut self, capacity: usize, header_reserve: usize) -> Self {
        self.audio_capacity = capacity;
        self.header_reserve = header_reserve;
        self
    }

    pub fn with_low_space_threshold(mut self, threshold: usize) -> Self {
        self.low_space_threshold = threshold;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_profile(mut self, profile: VendorProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Checks the invariants a connection relies on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.is_empty() {
            return Err(ConfigError::MissingField("session_id"));
        }
        if self.host.is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        if self.header_reserve >= self.audio_capacity {
            return Err(ConfigError::ReserveTooLarge {
                reserve: self.header_reserve,
                capacity: self.audio_capacity,
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        Ok(())
    }

    /// `ws://` or `wss://` URL of the target.
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{}{}", self.port, self.path)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_message_size: self.max_message_size,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}

// ── Service config ────────────────────────────────────────────────────────────

/// Process-wide settings for the event-loop service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// WebSocket ping cadence; `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Silence (no frame, no pong) after which a connection is dropped.
    pub pong_timeout: Duration,
    /// How long to wait for the remote close reply after sending ours.
    pub close_timeout: Duration,
    /// Upper bound on opening a connection.
    pub connect_timeout: Duration,
    /// `tracing` filter directive; `None` leaves logging setup to the host.
    pub log_level: Option<String>,
}

impl Default for ServiceConfig {
    /// | Field              | Default |
    /// |--------------------|---------|
    /// | keepalive_interval | 20 s    |
    /// | pong_timeout       | 60 s    |
    /// | close_timeout      | 5 s     |
    /// | connect_timeout    | 10 s    |
    /// | log_level          | none    |
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(20)),
            pong_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            log_level: None,
        }
    }
}

impl ServiceConfig {
    /// Reads overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for a value that is not a whole
    /// number of seconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(secs) = parse_secs(&lookup, ENV_KEEPALIVE_SECS)? {
            cfg.keepalive_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_secs(&lookup, ENV_PONG_TIMEOUT_SECS)? {
            cfg.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_CLOSE_TIMEOUT_SECS)? {
            cfg.close_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_CONNECT_TIMEOUT_SECS)? {
            cfg.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            cfg.log_level = Some(level);
        }
        Ok(cfg)
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
