//! Connection state machine.
//!
//! ```text
//!            connect()          established          close()
//!   Idle ──────────────► Connecting ──────► Connected ──────► Disconnecting
//!                           │                 │   │                 │
//!                   error   │      remote drop│   │error/timeout    │ close done
//!                           ▼                 ▼   ▼                 ▼
//!                         Failed       Disconnected  Failed     Disconnected
//! ```
//!
//! `Disconnected` and `Failed` are terminal: once reached, the connection
//! never changes state again.
//!
//! # Atomic state
//!
//! The state is read by caller threads (`is_connected`, `close`) and written
//! by the event-loop thread.  [`AtomicConnectionState`] stores it in an
//! `AtomicU8` and only allows moves listed in
//! [`ConnectionState::can_transition_to`], using compare-and-swap so two
//! threads racing on the same move cannot both win.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
    Failed = 5,
}

impl ConnectionState {
    /// `true` for `Disconnected` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// `true` while a transport handle may exist.
    pub fn has_transport(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            4 => Self::Disconnected,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder for a [`ConnectionState`].
#[derive(Debug)]
pub struct AtomicConnectionState {
    inner: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Moves `from` → `to` if the current state is `from` and the move is
    /// legal.  Returns the state observed before the attempt on failure.
    pub fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        if !from.can_transition_to(to) {
            return Err(self.load());
        }
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Disconnecting.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions_are_legal() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use ConnectionState::*;
        for next in [Idle, Connecting, Connected, Disconnecting, Disconnected, Failed] {
            assert!(!Disconnected.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_idle_cannot_skip_to_connected() {
        assert!(!ConnectionState::Idle.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn test_atomic_transition_succeeds_from_expected_state() {
        // Arrange
        let state = AtomicConnectionState::new(ConnectionState::Idle);

        // Act
        let result = state.transition(ConnectionState::Idle, ConnectionState::Connecting);

        // Assert
        assert_eq!(result, Ok(()));
        assert_eq!(state.load(), ConnectionState::Connecting);
    }

    #[test]
    fn test_atomic_transition_reports_actual_state_on_mismatch() {
        let state = AtomicConnectionState::new(ConnectionState::Connected);

        let result = state.transition(ConnectionState::Idle, ConnectionState::Connecting);

        assert_eq!(result, Err(ConnectionState::Connected));
    }

    #[test]
    fn test_atomic_transition_rejects_illegal_move() {
        let state = AtomicConnectionState::new(ConnectionState::Failed);

        let result = state.transition(ConnectionState::Failed, ConnectionState::Connected);

        assert_eq!(result, Err(ConnectionState::Failed));
        assert_eq!(state.load(), ConnectionState::Failed);
    }

    #[test]
    fn test_only_one_thread_wins_a_racing_transition() {
        // Arrange
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Connected));

        // Act: eight threads race to start the close
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&state);
                thread::spawn(move || {
                    s.transition(ConnectionState::Connected, ConnectionState::Disconnecting)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|won| *won)
            .count();

        // Assert
        assert_eq!(winners, 1);
        assert_eq!(state.load(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_display_uses_lowercase_names() {
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
    }
}
