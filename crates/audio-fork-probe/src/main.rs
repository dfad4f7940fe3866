//! audio-fork-probe: streams a raw PCM16 file through the audio bridge.
//!
//! The probe opens one connection to a WebSocket speech endpoint, optionally
//! sends a JSON start message, paces the file into the audio buffer in real
//! time, calls `finish()` and prints every inbound message until the
//! connection ends.  It exercises the same public API a call-handling layer
//! would use.
//!
//! # Usage
//!
//! ```text
//! audio-fork-probe --host stt.example.com --tls --path /v1/listen \
//!     --input call.raw --sample-rate 16000 --bearer $KEY
//! ```
//!
//! # Environment variables
//!
//! | Variable                   | Description                          |
//! |----------------------------|--------------------------------------|
//! | `AUDIO_FORK_PROBE_HOST`    | Remote host                          |
//! | `AUDIO_FORK_PROBE_API_KEY` | Bearer key                           |
//! | `AUDIO_FORK_LOG`           | Log filter (falls back to `RUST_LOG`)|
//!
//! The bridge's own `AUDIO_FORK_*` timing variables are honoured as well.

mod config;
mod stream;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use audio_fork_bridge::{
    BridgeEvent, BridgeService, ConnectionHandle, EventKind, NotifyCallback, TerminalOutcome,
};
use audio_fork_core::{ConnectionConfig, Credentials, ServiceConfig, VendorProfile};

use config::ProbeFile;
use stream::{StartMessage, StreamSettings};

const DEFAULT_SAMPLE_RATE: u32 = 8000;
const DEFAULT_CHANNELS: u16 = 1;
const DEFAULT_FRAME_MS: u32 = 20;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Streams a PCM16 file to a WebSocket speech endpoint and prints the replies.
#[derive(Debug, Parser)]
#[command(name = "audio-fork-probe", version)]
struct Cli {
    /// Remote host name or IP address.
    #[arg(long, env = "AUDIO_FORK_PROBE_HOST")]
    host: Option<String>,

    /// Remote port [default: 443 with --tls, 80 otherwise].
    #[arg(long)]
    port: Option<u16>,

    /// Request path [default: /].
    #[arg(long)]
    path: Option<String>,

    /// Connect with wss:// instead of ws://.
    #[arg(long)]
    tls: bool,

    /// Raw little-endian PCM16 input file.
    #[arg(long)]
    input: PathBuf,

    /// Input sample rate in Hz [default: 8000].
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Interleaved channel count [default: 1].
    #[arg(long)]
    channels: Option<u16>,

    /// Audio frame length in milliseconds [default: 20].
    #[arg(long)]
    frame_ms: Option<u32>,

    /// TOML file with connection and audio settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bearer API key.
    #[arg(long, env = "AUDIO_FORK_PROBE_API_KEY", conflicts_with = "basic_user")]
    bearer: Option<String>,

    /// Basic-auth user name.
    #[arg(long, requires = "basic_password")]
    basic_user: Option<String>,

    /// Basic-auth password.
    #[arg(long, requires = "basic_user")]
    basic_password: Option<String>,

    /// Deliver inbound binary messages (bidirectional profile).
    #[arg(long)]
    bidirectional: bool,

    /// Do not send the JSON start message before the audio.
    #[arg(long)]
    no_start_message: bool,

    /// Session identifier [default: random UUID].
    #[arg(long)]
    session_id: Option<String>,

    /// Seconds to wait for the remote to close after finish().
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

/// Everything the probe needs after merging CLI, file and defaults.
#[derive(Debug)]
struct ProbeSettings {
    connection: ConnectionConfig,
    stream: StreamSettings,
    input: PathBuf,
    wait: Duration,
}

impl Cli {
    /// Merges the command line over `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if no host is given by either source or the resulting
    /// connection config is invalid.
    fn into_settings(self, file: ProbeFile) -> anyhow::Result<ProbeSettings> {
        let Some(host) = self.host.or(file.host) else {
            bail!("no host given (use --host, AUDIO_FORK_PROBE_HOST or the config file)");
        };
        let use_tls = self.tls || file.use_tls.unwrap_or(false);
        let port = self
            .port
            .or(file.port)
            .unwrap_or(if use_tls { 443 } else { 80 });
        let path = self.path.or(file.path).unwrap_or_else(|| "/".to_string());
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let credentials = match (self.bearer, self.basic_user, self.basic_password) {
            (Some(api_key), _, _) => Credentials::Bearer { api_key },
            (None, Some(username), Some(password)) => Credentials::Basic { username, password },
            _ => file.credentials.unwrap_or_default(),
        };

        let mut profile = file.profile.unwrap_or_else(VendorProfile::plain);
        if self.bidirectional {
            profile.bidirectional_audio = true;
        }

        let mut connection = ConnectionConfig::new(session_id, host, port, path)
            .with_tls(use_tls)
            .with_credentials(credentials)
            .with_profile(profile);
        if let Some(size) = file.max_message_size {
            connection = connection.with_max_message_size(size);
        }
        connection
            .validate()
            .context("invalid connection settings")?;

        let stream = StreamSettings {
            sample_rate: self
                .sample_rate
                .or(file.audio.sample_rate)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
            channels: self
                .channels
                .or(file.audio.channels)
                .unwrap_or(DEFAULT_CHANNELS),
            frame_ms: self
                .frame_ms
                .or(file.audio.frame_ms)
                .unwrap_or(DEFAULT_FRAME_MS),
            send_start: !self.no_start_message,
        };

        Ok(ProbeSettings {
            connection,
            stream,
            input: self.input,
            wait: Duration::from_secs(self.wait_secs),
        })
    }
}

// ── Event handling ────────────────────────────────────────────────────────────

/// Prints one event; returns the outcome if it was terminal.
fn report_event(event: &BridgeEvent) -> Option<TerminalOutcome> {
    match &event.kind {
        EventKind::Message(text) => println!("{text}"),
        EventKind::Binary(bytes) => info!("received {} bytes of binary audio", bytes.len()),
        EventKind::BufferOverrun => warn!("audio buffer overrun; pending audio dropped"),
        EventKind::ConnectFail { reason } => warn!("connect failed: {reason}"),
        other => info!("{}", other.name()),
    }
    event.kind.terminal_outcome()
}

/// Prints everything already queued without blocking.
fn drain_events(events: &Receiver<BridgeEvent>, outcome: &mut Option<TerminalOutcome>) {
    while let Ok(event) = events.try_recv() {
        if let Some(o) = report_event(&event) {
            *outcome = Some(o);
        }
    }
}

/// Blocks until a terminal event arrives or `timeout` elapses.
fn wait_for_terminal(events: &Receiver<BridgeEvent>, timeout: Duration) -> Option<TerminalOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(left) {
            Ok(event) => {
                if let Some(outcome) = report_event(&event) {
                    return Some(outcome);
                }
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Blocks until the connect attempt resolves.  Returns `Ok(())` once connected.
fn wait_for_connect(events: &Receiver<BridgeEvent>, timeout: Duration) -> anyhow::Result<()> {
    let event = events
        .recv_timeout(timeout)
        .context("no connect result from the bridge")?;
    report_event(&event);
    match event.kind {
        EventKind::ConnectSuccess => Ok(()),
        EventKind::ConnectFail { reason } => bail!("connect failed: {reason}"),
        other => bail!("unexpected first event: {}", other.name()),
    }
}

fn run(
    conn: &ConnectionHandle,
    events: &Receiver<BridgeEvent>,
    settings: &ProbeSettings,
    service: &ServiceConfig,
) -> anyhow::Result<TerminalOutcome> {
    let pcm = std::fs::read(&settings.input)
        .with_context(|| format!("cannot read {}", settings.input.display()))?;

    // Queued before connect so it is the first frame on the wire.
    if settings.stream.send_start {
        let start = StartMessage::new(conn.session_id(), &settings.stream).to_json()?;
        conn.buffer_for_sending(start)?;
    }
    conn.connect()?;
    wait_for_connect(events, service.connect_timeout + Duration::from_secs(1))?;

    let mut outcome = None;
    let report = stream::stream_pcm(conn, &pcm, &settings.stream, || {
        drain_events(events, &mut outcome)
    });
    info!(
        "streamed {} frames ({} bytes, {} overruns)",
        report.frames, report.bytes, report.overruns
    );
    if let Some(outcome) = outcome {
        return Ok(outcome);
    }

    if conn.is_connected() {
        conn.finish()?;
    }
    if let Some(outcome) = wait_for_terminal(events, settings.wait) {
        return Ok(outcome);
    }

    info!("remote did not close within {:?}; closing", settings.wait);
    let completion = conn.close_with_completion()?;
    drain_events(events, &mut outcome);
    Ok(completion
        .wait_blocking()
        .or(outcome)
        .unwrap_or(TerminalOutcome::Dropped))
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(audio_fork_bridge::logging::filter("info"))
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => ProbeFile::load(path)?,
        None => ProbeFile::default(),
    };
    let settings = cli.into_settings(file)?;
    let service_config = ServiceConfig::from_env()?;

    info!(
        "probe starting: session {} -> {}",
        settings.connection.session_id,
        settings.connection.url()
    );

    let service = BridgeService::initialize_websocket(service_config.clone())?;
    let (tx, events) = mpsc::channel();
    let callback: NotifyCallback = Arc::new(move |event: BridgeEvent| {
        let _ = tx.send(event);
    });
    let conn = service.create_connection(settings.connection.clone(), callback)?;

    let result = run(&conn, &events, &settings, &service_config);
    service.shutdown()?;

    match result? {
        TerminalOutcome::ClosedGracefully => {
            info!("connection closed gracefully");
            Ok(())
        }
        outcome => bail!("connection {outcome}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["audio-fork-probe", "--input", "call.raw"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_cli_requires_input() {
        let result = Cli::try_parse_from(["audio-fork-probe", "--host", "h"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_bearer_conflicts_with_basic() {
        let result = Cli::try_parse_from([
            "audio-fork-probe",
            "--input",
            "a.raw",
            "--bearer",
            "k",
            "--basic-user",
            "u",
            "--basic-password",
            "p",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_basic_user_requires_password() {
        let result =
            Cli::try_parse_from(["audio-fork-probe", "--input", "a.raw", "--basic-user", "u"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_without_file() {
        // Arrange
        let cli = parse(&["--host", "localhost"]);

        // Act
        let settings = cli.into_settings(ProbeFile::default()).unwrap();

        // Assert
        assert_eq!(settings.connection.url(), "ws://localhost:80/");
        assert_eq!(settings.stream.sample_rate, 8000);
        assert_eq!(settings.stream.channels, 1);
        assert_eq!(settings.stream.frame_ms, 20);
        assert!(settings.stream.send_start);
        assert_eq!(settings.connection.credentials, Credentials::None);
        assert!(!settings.connection.profile.bidirectional_audio);
    }

    #[test]
    fn test_tls_defaults_port_443() {
        let settings = parse(&["--host", "stt.example.com", "--tls", "--path", "/v1"])
            .into_settings(ProbeFile::default())
            .unwrap();
        assert_eq!(settings.connection.url(), "wss://stt.example.com:443/v1");
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let result = Cli {
            host: None,
            ..parse(&[])
        }
        .into_settings(ProbeFile::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        // Arrange
        let file = ProbeFile {
            host: Some("file-host".into()),
            port: Some(9000),
            credentials: Some(Credentials::Bearer {
                api_key: "file-key".into(),
            }),
            ..ProbeFile::default()
        };
        let cli = parse(&[
            "--host",
            "cli-host",
            "--basic-user",
            "u",
            "--basic-password",
            "p",
            "--sample-rate",
            "16000",
        ]);

        // Act
        let settings = cli.into_settings(file).unwrap();

        // Assert
        assert_eq!(settings.connection.host, "cli-host");
        assert_eq!(settings.connection.port, 9000);
        assert_eq!(
            settings.connection.credentials,
            Credentials::Basic {
                username: "u".into(),
                password: "p".into()
            }
        );
        assert_eq!(settings.stream.sample_rate, 16000);
    }

    #[test]
    fn test_file_fills_gaps() {
        // Arrange
        let mut file = ProbeFile {
            host: Some("file-host".into()),
            use_tls: Some(true),
            profile: Some(VendorProfile::keepalive(15)),
            ..ProbeFile::default()
        };
        file.audio.frame_ms = Some(10);

        // Act
        let settings = parse(&["--no-start-message"]).into_settings(file).unwrap();

        // Assert
        assert!(settings.connection.use_tls);
        assert_eq!(settings.connection.port, 443);
        assert_eq!(settings.connection.profile.keepalive_secs, Some(15));
        assert_eq!(settings.stream.frame_ms, 10);
        assert!(!settings.stream.send_start);
    }

    #[test]
    fn test_bidirectional_flag_sets_profile() {
        let settings = parse(&["--host", "h", "--bidirectional"])
            .into_settings(ProbeFile::default())
            .unwrap();
        assert!(settings.connection.profile.bidirectional_audio);
    }

    #[test]
    fn test_session_id_override() {
        let settings = parse(&["--host", "h", "--session-id", "call-7"])
            .into_settings(ProbeFile::default())
            .unwrap();
        assert_eq!(settings.connection.session_id, "call-7");
    }

    #[test]
    fn test_report_event_returns_terminal_outcome() {
        let event = |kind| BridgeEvent {
            session_id: "s".into(),
            tag: "audio_fork".into(),
            kind,
        };
        assert_eq!(report_event(&event(EventKind::Message("hi".into()))), None);
        assert_eq!(
            report_event(&event(EventKind::ConnectionDropped)),
            Some(TerminalOutcome::Dropped)
        );
    }

    #[test]
    fn test_wait_for_terminal_times_out() {
        let (_tx, rx) = mpsc::channel::<BridgeEvent>();
        assert_eq!(wait_for_terminal(&rx, Duration::from_millis(20)), None);
    }
}
