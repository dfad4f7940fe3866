//! Paced PCM streaming and the JSON start message.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use audio_fork_bridge::{AudioWriteOutcome, ConnectionHandle};

/// Input format and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
    pub send_start: bool,
}

impl StreamSettings {
    /// Bytes of 16-bit PCM in one frame.
    pub fn frame_bytes(&self) -> usize {
        let samples = self.sample_rate as usize * self.frame_ms as usize / 1000;
        (samples * self.channels as usize * 2).max(2)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_ms))
    }
}

#[derive(Debug, Serialize)]
struct AudioFormat {
    encoding: &'static str,
    sample_rate: u32,
    channels: u16,
}

/// Control message announcing the audio format before the first frame.
#[derive(Debug, Serialize)]
pub struct StartMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session_id: &'a str,
    audio: AudioFormat,
}

impl<'a> StartMessage<'a> {
    pub fn new(session_id: &'a str, settings: &StreamSettings) -> Self {
        Self {
            kind: "start",
            session_id,
            audio: AudioFormat {
                encoding: "linear16",
                sample_rate: settings.sample_rate,
                channels: settings.channels,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Totals for one streaming run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub frames: usize,
    pub bytes: usize,
    pub overruns: usize,
}

/// Writes `pcm` into the connection's audio buffer one frame at a time, in
/// real time.  Stops early if the connection leaves `Connected`.
///
/// `on_frame` runs after each frame so the caller can service events.
pub fn stream_pcm<F>(
    conn: &ConnectionHandle,
    pcm: &[u8],
    settings: &StreamSettings,
    mut on_frame: F,
) -> StreamReport
where
    F: FnMut(),
{
    let mut report = StreamReport::default();
    let started = Instant::now();

    for (n, frame) in pcm.chunks(settings.frame_bytes()).enumerate() {
        if !conn.is_connected() {
            warn!(
                "session {}: connection is {}; stopping after {} frames",
                conn.session_id(),
                conn.state(),
                report.frames
            );
            break;
        }

        {
            let mut audio = conn.lock_audio_buffer();
            match audio.write(frame) {
                AudioWriteOutcome::Written(len) => report.bytes += len,
                AudioWriteOutcome::Overrun { written, .. } => {
                    report.bytes += written;
                    report.overruns += 1;
                }
            }
            if audio.is_low_on_space() {
                debug!(
                    "session {}: audio buffer low ({} bytes free)",
                    conn.session_id(),
                    audio.space_available()
                );
            }
        }
        report.frames += 1;
        on_frame();

        let due = started + settings.frame_duration() * (n as u32 + 1);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    report
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(sample_rate: u32, channels: u16, frame_ms: u32) -> StreamSettings {
        StreamSettings {
            sample_rate,
            channels,
            frame_ms,
            send_start: true,
        }
    }

    #[test]
    fn test_frame_bytes_for_common_formats() {
        assert_eq!(settings(8000, 1, 20).frame_bytes(), 320);
        assert_eq!(settings(16000, 1, 20).frame_bytes(), 640);
        assert_eq!(settings(16000, 2, 10).frame_bytes(), 640);
    }

    #[test]
    fn test_frame_bytes_never_zero() {
        assert_eq!(settings(8000, 1, 0).frame_bytes(), 2);
    }

    #[test]
    fn test_start_message_json_shape() {
        // Arrange
        let s = settings(16000, 1, 20);

        // Act
        let json = StartMessage::new("call-1", &s).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        // Assert
        assert_eq!(value["type"], "start");
        assert_eq!(value["session_id"], "call-1");
        assert_eq!(value["audio"]["encoding"], "linear16");
        assert_eq!(value["audio"]["sample_rate"], 16000);
        assert_eq!(value["audio"]["channels"], 1);
    }
}
