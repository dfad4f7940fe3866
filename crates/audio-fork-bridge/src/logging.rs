//! `tracing` subscriber setup.
//!
//! The bridge is usually embedded in a host process that may already have a
//! subscriber, so [`init`] never panics when one is installed.
//!
//! Filter precedence: `AUDIO_FORK_LOG`, then `RUST_LOG`, then the level passed
//! in.

use audio_fork_core::domain::config::ENV_LOG;
use tracing_subscriber::EnvFilter;

/// Builds the filter from the environment, falling back to `default_level`.
pub fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs a formatting subscriber.  Returns `false` if a global subscriber
/// was already set.
pub fn init(default_level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_does_not_panic() {
        let _ = init("info");
        assert!(!init("debug"));
    }
}
