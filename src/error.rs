//! Custom error types for the crate.
//!
//! This module defines the primary error type, `HmiError`, for the device-communication
//! layer. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that callers can act on: configuration and address problems,
//! backend I/O, malformed payloads, and operator-level conflicts such as an invalid
//! direction for a device.
//!
//! ## Error Hierarchy
//!
//! - **`Http`** / **`InvalidUri`** / **`HttpStatus`**: REST calls to the control backend.
//! - **`Json`**: request or response bodies that do not (de)serialize.
//! - **`WebSocket`**: the push transport's socket.
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures respectively.
//! - **`Address`**: a backend or socket URL that cannot be normalized.
//! - **`InvalidDirection`** / **`NotCommandable`**: a command that can never be valid for
//!   the addressed device.
//! - **`SessionState`** / **`RunRecord`**: control-session orchestration failures.
//!
//! The transport manager, the command dispatcher and the control session never surface
//! transport failures as `Err`; they convert them to status transitions or
//! `DispatchOutcome`s. `HmiError` is what the layers underneath them return.

use thiserror::Error;

use crate::connection::AddressError;
use crate::protocol::{DeviceId, Direction};

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, HmiError>;

/// Errors produced by the device-communication layer.
#[derive(Error, Debug)]
pub enum HmiError {
    /// HTTP transport error (connection refused, reset, DNS, etc.).
    #[error("HTTP transport error: {0}")]
    Http(#[from] hyper::Error),

    /// Request URI could not be built.
    #[error("Invalid request URI: {0}")]
    InvalidUri(String),

    /// Backend answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code returned by the backend
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error from the push transport.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Backend or socket address could not be normalized.
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    /// Direction is not defined for the addressed device.
    #[error("Direction {direction:?} is not valid for {device}")]
    InvalidDirection {
        /// Addressed device
        device: DeviceId,
        /// Rejected direction
        direction: Direction,
    },

    /// Device accepts no commands (telemetry only).
    #[error("Device {0} does not accept commands")]
    NotCommandable(DeviceId),

    /// Operation is not allowed in the current session state.
    #[error("Session state conflict: {0}")]
    SessionState(String),

    /// Run record could not be created or closed.
    #[error("Run record error: {0}")]
    RunRecord(String),
}

impl From<figment::Error> for HmiError {
    fn from(value: figment::Error) -> Self {
        HmiError::Config(Box::new(value))
    }
}

impl HmiError {
    /// Returns `true` for failures caused by the network or the remote side, where a
    /// later attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            HmiError::Http(_) | HmiError::WebSocket(_) => true,
            HmiError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_display_includes_code_and_body() {
        let err = HmiError::HttpStatus {
            status: 503,
            body: "busy".into(),
        };
        assert_eq!(err.to_string(), "HTTP 503: busy");
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = HmiError::HttpStatus {
            status: 404,
            body: String::new(),
        };
        assert!(!err.is_transient());
        assert!(!HmiError::NotCommandable(DeviceId::Sdu).is_transient());
    }

    #[test]
    fn invalid_direction_names_device() {
        let err = HmiError::InvalidDirection {
            device: DeviceId::Dcu,
            direction: Direction::Forward,
        };
        let text = err.to_string();
        assert!(text.contains("dcu"));
        assert!(text.contains("Forward"));
    }
}
