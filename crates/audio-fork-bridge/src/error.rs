//! Error types returned by the bridge API.

use audio_fork_core::{BufferError, ConfigError, ConnectionState};
use thiserror::Error;

/// Errors returned synchronously to callers of the bridge.
///
/// Asynchronous failures (a refused handshake, a dropped socket) are never
/// returned here; they arrive as events on the connection's notify callback.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The operation is not valid in the connection's current state.
    ///
    /// For example, `connect()` on a connection that already failed: a
    /// connection object is single-use.
    #[error("session {session_id}: cannot {operation} while {state}")]
    InvalidState {
        session_id: String,
        operation: &'static str,
        state: ConnectionState,
    },

    /// The event-loop service has been shut down.
    #[error("the bridge service is stopped")]
    ServiceStopped,

    /// The connection configuration was rejected.
    #[error("invalid connection config: {0}")]
    Config(#[from] ConfigError),

    /// The audio buffer could not be created.
    #[error("invalid audio buffer: {0}")]
    Buffer(#[from] BufferError),

    /// The async runtime for the event loop could not be built.
    #[error("failed to build the event-loop runtime")]
    RuntimeInit(#[source] std::io::Error),

    /// The event-loop thread could not be started.
    #[error("failed to spawn the event-loop thread")]
    ThreadSpawn(#[source] std::io::Error),

    /// The event-loop thread panicked before it could be joined.
    #[error("the event-loop thread panicked")]
    ThreadPanicked,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message_names_session_and_state() {
        let err = BridgeError::InvalidState {
            session_id: "call-7".into(),
            operation: "connect",
            state: ConnectionState::Failed,
        };
        assert_eq!(err.to_string(), "session call-7: cannot connect while failed");
    }

    #[test]
    fn test_config_error_converts() {
        let err: BridgeError = ConfigError::MissingField("host").into();
        assert!(matches!(err, BridgeError::Config(ConfigError::MissingField("host"))));
    }
}
