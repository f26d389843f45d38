//! Connection status and retry policy.
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──success──> Connected
//!      ▲                          │                       │
//!      │                       failure             failure / close
//!      │                          ▼                       ▼
//!      └──disconnect()──────── Error <──retries exhausted── (backoff, retry)
//! ```
//!
//! Both strategies retry with [`ReconnectConfig`]; once `max_attempts` consecutive
//! failures have been seen the manager settles in [`ConnectionStatus::Error`] and waits
//! for an explicit `connect()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::TransportConfig;

/// Connection status owned by the transport manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No connection and no retry pending
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Live
    Connected,
    /// Failed; a retry may be pending
    Error,
}

impl ConnectionStatus {
    /// Returns `true` while connecting or connected.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Returns `true` if connected.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short status label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

/// Backoff and retry bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles).
    pub backoff_multiplier: f64,
    /// Consecutive failures tolerated (0 = unlimited).
    pub max_attempts: u32,
    /// Add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: 10,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Policy for the push strategy's socket reconnects.
    #[must_use]
    pub fn for_push(config: &TransportConfig) -> Self {
        Self {
            initial_delay: config.reconnect_interval(),
            max_delay: config.backoff_cap().max(config.reconnect_interval()),
            backoff_multiplier: 2.0,
            max_attempts: config.max_reconnect_attempts,
            jitter: config.jitter,
        }
    }

    /// Policy for the pull strategy's failed ticks: `min(interval * 2^retries, cap)`.
    #[must_use]
    pub fn for_pull(config: &TransportConfig) -> Self {
        Self {
            initial_delay: config.poll_interval(),
            max_delay: config.backoff_cap(),
            backoff_multiplier: 2.0,
            max_attempts: config.max_retries,
            jitter: config.jitter,
        }
    }

    /// Delay after `failures` consecutive failures: `initial * multiplier^failures`, capped.
    #[must_use]
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            capped_delay * (1.0 + rand_jitter() * 0.25)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt.saturating_sub(1))
    }

    /// Whether another attempt should follow `failures` consecutive failures.
    #[must_use]
    pub fn should_retry(&self, failures: u32) -> bool {
        self.max_attempts == 0 || failures < self.max_attempts
    }
}

/// Pseudo-random jitter in `[0, 1)` from the clock's nanoseconds.
fn rand_jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

/// Classify a raw transport error message for retry decisions.
///
/// Address and scheme problems never heal on their own; network failures may.
#[must_use]
pub fn is_retriable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if error_lower.contains("invalid url")
        || error_lower.contains("invalid uri")
        || error_lower.contains("invalid address")
        || error_lower.contains("url error")
        || error_lower.contains("unsupported scheme")
        || error_lower.contains("url scheme not supported")
    {
        return false;
    }

    error_lower.contains("connection refused")
        || error_lower.contains("connection reset")
        || error_lower.contains("connection closed")
        || error_lower.contains("timed out")
        || error_lower.contains("timeout")
        || error_lower.contains("network")
        || error_lower.contains("dns")
        || error_lower.contains("resolve")
        || error_lower.contains("unreachable")
        || error_lower.contains("io error")
        || error_lower.contains("http transport")
        || error_lower.contains("websocket")
        || error_lower.contains("http 5")
}

/// Convert a raw error message into an operator-facing description.
#[must_use]
pub fn friendly_error_message(error: &str) -> String {
    let error_lower = error.to_lowercase();

    if error_lower.contains("connection refused") {
        return "Control backend not running or not reachable on this port.".into();
    }

    if error_lower.contains("dns")
        || error_lower.contains("resolve")
        || error_lower.contains("no such host")
    {
        return "Cannot resolve backend hostname. Check the address or network connection.".into();
    }

    if error_lower.contains("timed out") || error_lower.contains("timeout") {
        return "Connection timed out. The backend may be overloaded or unreachable.".into();
    }

    if error_lower.contains("connection reset") {
        return "Connection was reset. The backend may have restarted.".into();
    }

    if error_lower.contains("unreachable") || error_lower.contains("network is down") {
        return "Network unreachable. Check the rig network connection.".into();
    }

    if error_lower.contains("certificate")
        || error_lower.contains("tls")
        || error_lower.contains("ssl")
    {
        return "TLS error. Check that the backend supports the configured scheme.".into();
    }

    if error_lower.contains("invalid url") || error_lower.contains("invalid uri") {
        return "Invalid address format. Use http://host:port.".into();
    }

    format!("Connection failed: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_policy() -> ReconnectConfig {
        ReconnectConfig::for_pull(&TransportConfig::default())
    }

    #[test]
    fn pull_backoff_doubles_up_to_cap() {
        let config = pull_policy();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn delay_for_attempt_is_one_based() {
        let config = ReconnectConfig::for_push(&TransportConfig::default());
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = ReconnectConfig {
            jitter: true,
            ..pull_policy()
        };
        for failures in 0..5 {
            let plain = ReconnectConfig {
                jitter: false,
                ..config.clone()
            }
            .backoff_delay(failures);
            let jittered = config.backoff_delay(failures);
            assert!(jittered >= plain);
            assert!(jittered.as_secs_f64() <= plain.as_secs_f64() * 1.25 + 1e-9);
        }
    }

    #[test]
    fn retries_are_bounded() {
        let config = pull_policy();
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));

        let unlimited = ReconnectConfig {
            max_attempts: 0,
            ..config
        };
        assert!(unlimited.should_retry(1_000));
    }

    #[test]
    fn error_classification() {
        assert!(is_retriable_error("HTTP transport error: Connection refused (os error 111)"));
        assert!(is_retriable_error("HTTP 503: busy"));
        assert!(!is_retriable_error("Invalid URI: ftp://x"));
        assert!(!is_retriable_error("HTTP 404: missing"));
    }

    #[test]
    fn friendly_messages() {
        assert!(friendly_error_message("tcp connect error: Connection refused").contains("not running"));
        assert!(friendly_error_message("operation timed out").contains("timed out"));
        assert_eq!(friendly_error_message("weird"), "Connection failed: weird");
    }

    #[test]
    fn status_labels_and_wire_names() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Error.label(), "Error");
        assert!(ConnectionStatus::Connecting.is_active());
        assert!(!ConnectionStatus::Error.is_active());
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Connected).unwrap(),
            "\"connected\""
        );
    }
}
