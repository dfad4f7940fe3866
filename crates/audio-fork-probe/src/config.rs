//! Optional TOML config file for the probe.
//!
//! Every field is optional; command-line arguments override file values, and
//! file values override built-in defaults.
//!
//! ```toml
//! host = "stt.example.com"
//! port = 443
//! path = "/v1/listen"
//! use_tls = true
//! max_message_size = 650000
//!
//! [credentials]
//! type = "bearer"
//! api_key = "..."
//!
//! [profile]
//! tag = "probe"
//! finish = { text = "{\"type\":\"CloseStream\"}" }
//!
//! [audio]
//! sample_rate = 16000
//! channels = 1
//! frame_ms = 20
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use audio_fork_core::{Credentials, VendorProfile};

/// Errors while loading the probe config file.
#[derive(Debug, Error)]
pub enum ProbeConfigError {
    #[error("cannot read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Audio format of the input file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub frame_ms: Option<u32>,
}

/// Contents of a probe config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProbeFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub use_tls: Option<bool>,
    pub max_message_size: Option<usize>,
    pub credentials: Option<Credentials>,
    pub profile: Option<VendorProfile>,
    pub audio: AudioSection,
}

impl ProbeFile {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ProbeConfigError> {
        toml::from_str(text).map_err(|source| ProbeConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self, ProbeConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProbeConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
