//! Coordinator configuration.
//!
//! # Environment Variables
//!
//! - `MOLT_RESTART_MARKER`: argument placed at argv[1] of the replacement (default: `-restart`)
//! - `MOLT_RESTART_TIMEOUT_SECS`: how long to wait for the replacement's ready signal;
//!   `0` waits forever (default: 0)

use std::time::Duration;

use tracing::warn;

/// Marker used when none is configured.
pub const DEFAULT_MARKER: &str = "-restart";

/// Settings for one [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartConfig {
    /// Restart marker. Empty means [`DEFAULT_MARKER`].
    pub marker: String,
    /// Wait bound for the termination signal. Zero means unbounded.
    pub timeout: Duration,
    /// Signal that triggers a handoff.
    pub trigger_signal: i32,
    /// Signal the replacement sends once it is ready.
    pub terminate_signal: i32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            marker: String::new(),
            timeout: Duration::ZERO,
            trigger_signal: libc::SIGHUP,
            terminate_signal: libc::SIGTERM,
        }
    }
}

impl RestartConfig {
    /// Defaults overridden by `MOLT_RESTART_MARKER` and `MOLT_RESTART_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(marker) = std::env::var("MOLT_RESTART_MARKER") {
            config.marker = marker;
        }

        if let Ok(raw) = std::env::var("MOLT_RESTART_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.timeout = Duration::from_secs(secs),
                Err(e) => warn!(
                    value = %raw,
                    error = %e,
                    "Ignoring invalid MOLT_RESTART_TIMEOUT_SECS"
                ),
            }
        }

        config
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use `trigger` and `terminate` instead of `SIGHUP` and `SIGTERM`.
    pub fn with_signals(mut self, trigger: i32, terminate: i32) -> Self {
        self.trigger_signal = trigger;
        self.terminate_signal = terminate;
        self
    }

    /// The marker actually placed on the replacement's command line.
    pub fn effective_marker(&self) -> &str {
        if self.marker.is_empty() {
            DEFAULT_MARKER
        } else {
            &self.marker
        }
    }

    /// The timeout, or `None` when the wait is unbounded.
    pub fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_marker_falls_back_to_default() {
        let config = RestartConfig::default();
        assert_eq!(config.effective_marker(), "-restart");

        let config = config.with_marker("--reborn");
        assert_eq!(config.effective_marker(), "--reborn");
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = RestartConfig::default();
        assert_eq!(config.deadline(), None);

        let config = config.with_timeout(Duration::from_millis(250));
        assert_eq!(config.deadline(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_default_signals() {
        let config = RestartConfig::default();
        assert_eq!(config.trigger_signal, libc::SIGHUP);
        assert_eq!(config.terminate_signal, libc::SIGTERM);

        let config = config.with_signals(libc::SIGUSR1, libc::SIGUSR2);
        assert_eq!(config.trigger_signal, libc::SIGUSR1);
        assert_eq!(config.terminate_signal, libc::SIGUSR2);
    }

    #[test]
    fn test_from_env_defaults() {
        std::env::remove_var("MOLT_RESTART_MARKER");
        std::env::remove_var("MOLT_RESTART_TIMEOUT_SECS");
        let config = RestartConfig::from_env();
        assert_eq!(config, RestartConfig::default());
    }
}
