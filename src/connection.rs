//! Backend address configuration and URL normalization.
//!
//! This module provides types and utilities for locating the control backend:
//! - [`BackendAddress`]: Validated REST base URL with source tracking
//! - [`AddressSource`]: Where the address configuration came from
//! - [`AddressError`]: User-friendly validation errors
//!
//! # Address Resolution Precedence
//!
//! Addresses are resolved in this order (highest priority first):
//! 1. User input (command line)
//! 2. `HMI_API_URL` environment variable
//! 3. `backend.url` from the configuration file
//! 4. A host hint (`backend.host`, or the host the operator reached the rig on)
//!    combined with the backend port
//! 5. Default: `http://localhost:8000`
//!
//! The socket URL for the push strategy resolves separately, see [`resolve_socket_url`].
//!
//! # Example
//!
//! ```
//! use rig_hmi::connection::{AddressSource, BackendAddress};
//!
//! let addr = BackendAddress::parse("192.168.2.1", AddressSource::UserInput)?;
//! assert_eq!(addr.as_str(), "http://192.168.2.1:8000/");
//! assert_eq!(addr.socket_url()?.as_str(), "ws://192.168.2.1:8000/ws");
//! # Ok::<(), rig_hmi::connection::AddressError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Environment variable overriding the REST base URL.
pub const ENV_API_URL: &str = "HMI_API_URL";

/// Environment variable overriding the push-strategy socket URL.
pub const ENV_WEBSOCKET_URL: &str = "HMI_WEBSOCKET_URL";

/// Port the control backend listens on.
pub const DEFAULT_BACKEND_PORT: u16 = 8000;

/// Default backend address when no configuration is provided.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Path of the backend's socket endpoint.
pub const SOCKET_PATH: &str = "/ws";

/// Source of the backend address configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSource {
    /// Hardcoded default (`http://localhost:8000`)
    Default,
    /// Derived from a host hint plus the backend port
    PageHost,
    /// Read from the configuration file
    Config,
    /// Loaded from `HMI_API_URL`
    Environment,
    /// Passed explicitly by the operator
    UserInput,
}

impl AddressSource {
    /// Returns the priority for address resolution (higher = preferred).
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::PageHost => 1,
            Self::Config => 2,
            Self::Environment => 3,
            Self::UserInput => 4,
        }
    }

    /// Short label for status lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::PageHost => "host",
            Self::Config => "config",
            Self::Environment => "env",
            Self::UserInput => "user",
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::PageHost => write!(f, "Derived from host"),
            Self::Config => write!(f, "Configuration file"),
            Self::Environment => write!(f, "Environment ({ENV_API_URL})"),
            Self::UserInput => write!(f, "User input"),
        }
    }
}

/// Validated backend address with metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddress {
    /// The normalized URL (always has scheme and port)
    url: String,
    /// Where this address came from
    source: AddressSource,
}

impl BackendAddress {
    /// Parse and normalize a backend URL.
    ///
    /// Accepts bare `host`, `host:port` or a full `http(s)://` URL.
    pub fn parse(input: &str, source: AddressSource) -> Result<Self, AddressError> {
        let normalized = normalize_url(input)?;
        Ok(Self {
            url: normalized.to_string(),
            source,
        })
    }

    /// Build an address from a bare host and a port.
    pub fn from_host(host: &str, port: u16, source: AddressSource) -> Result<Self, AddressError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(AddressError::EmptyInput);
        }
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        Self::parse(&format!("http://{host}:{port}"), source)
    }

    /// Returns the normalized URL string (with trailing `/`).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Returns where this address came from.
    #[must_use]
    pub fn source(&self) -> AddressSource {
        self.source
    }

    /// Returns `true` if this address uses TLS (https scheme).
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// Join an endpoint path (`"send_command/"`, `"/device_status/"`) onto the base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path.trim_start_matches('/'))
    }

    /// Socket URL derived from this address: same host and port, `ws`/`wss`, path `/ws`.
    pub fn socket_url(&self) -> Result<Url, AddressError> {
        let mut url = Url::parse(&self.url).map_err(|e| AddressError::InvalidUrl(e.to_string()))?;
        let scheme = if self.is_tls() { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| AddressError::UnsupportedScheme(scheme.to_string()))?;
        url.set_path(SOCKET_PATH);
        Ok(url)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl Default for BackendAddress {
    fn default() -> Self {
        Self {
            url: format!("{DEFAULT_BACKEND_URL}/"),
            source: AddressSource::Default,
        }
    }
}

/// URL validation error with user-friendly messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Input was empty or whitespace-only
    EmptyInput,
    /// URL parsing failed
    InvalidUrl(String),
    /// No host was found in the URL
    MissingHost,
    /// Port could not be set
    InvalidPort(String),
    /// Unsupported URL scheme
    UnsupportedScheme(String),
}

impl std::error::Error for AddressError {}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "Address cannot be empty"),
            Self::InvalidUrl(e) => write!(f, "Invalid URL: {e}"),
            Self::MissingHost => write!(f, "URL must include a host"),
            Self::InvalidPort(e) => write!(f, "Invalid port: {e}"),
            Self::UnsupportedScheme(s) => write!(f, "Unsupported scheme '{s}'"),
        }
    }
}

/// Normalize a backend URL string.
///
/// - Adds `http://` if the scheme is missing
/// - Adds port 8000 if the port is missing
/// - Trims whitespace
/// - Rejects schemes other than `http`/`https`
pub fn normalize_url(input: &str) -> Result<Url, AddressError> {
    normalize_with_schemes(input, "http", &["http", "https"])
}

/// Normalize a socket URL string (`ws`/`wss`, default port 8000, path kept as given).
pub fn normalize_socket_url(input: &str) -> Result<Url, AddressError> {
    normalize_with_schemes(input, "ws", &["ws", "wss"])
}

fn normalize_with_schemes(
    input: &str,
    default_scheme: &str,
    allowed: &[&str],
) -> Result<Url, AddressError> {
    let input = input.trim();

    if input.is_empty() {
        return Err(AddressError::EmptyInput);
    }

    let with_scheme = if input.contains("://") {
        input.to_string()
    } else {
        format!("{default_scheme}://{input}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| AddressError::InvalidUrl(e.to_string()))?;

    let scheme = url.scheme().to_lowercase();
    if !allowed.contains(&scheme.as_str()) {
        return Err(AddressError::UnsupportedScheme(scheme));
    }

    if url.host().is_none() {
        return Err(AddressError::MissingHost);
    }

    if url.port().is_none() {
        url.set_port(Some(DEFAULT_BACKEND_PORT))
            .map_err(|()| AddressError::InvalidPort("Cannot set port on this URL".to_string()))?;
    }

    Ok(url)
}

/// Inputs to address resolution, lowest layers first.
#[derive(Debug, Clone, Default)]
pub struct AddressInputs<'a> {
    /// Address passed by the operator
    pub user_input: Option<&'a str>,
    /// `backend.url` from configuration
    pub config_url: Option<&'a str>,
    /// Host hint (`backend.host` or the host the HMI was reached on)
    pub host_hint: Option<&'a str>,
    /// Port used together with `host_hint`
    pub port: Option<u16>,
}

/// Resolve the backend address from multiple sources with precedence.
///
/// Invalid candidates are skipped with a warning; the result falls back to
/// [`DEFAULT_BACKEND_URL`] and never fails.
#[must_use]
pub fn resolve_address(inputs: &AddressInputs<'_>) -> BackendAddress {
    let env_url = std::env::var(ENV_API_URL).ok();
    let port = inputs.port.unwrap_or(DEFAULT_BACKEND_PORT);

    let candidates = [
        (inputs.user_input, AddressSource::UserInput),
        (env_url.as_deref(), AddressSource::Environment),
        (inputs.config_url, AddressSource::Config),
    ];
    for (candidate, source) in candidates {
        let Some(raw) = candidate.filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        match BackendAddress::parse(raw, source) {
            Ok(addr) => return addr,
            Err(e) => tracing::warn!(source = %source, input = raw, error = %e, "Ignoring invalid backend address"),
        }
    }

    if let Some(host) = inputs.host_hint.filter(|s| !s.trim().is_empty()) {
        match BackendAddress::from_host(host, port, AddressSource::PageHost) {
            Ok(addr) => return addr,
            Err(e) => tracing::warn!(host, error = %e, "Ignoring invalid host hint"),
        }
    }

    BackendAddress::default()
}

/// Resolve the push-strategy socket URL.
///
/// Precedence: `HMI_WEBSOCKET_URL` > configured `transport.socket_url` > derived
/// from `backend`.
pub fn resolve_socket_url(
    configured: Option<&str>,
    backend: &BackendAddress,
) -> Result<Url, AddressError> {
    let env_url = std::env::var(ENV_WEBSOCKET_URL).ok();
    for (candidate, origin) in [(env_url.as_deref(), ENV_WEBSOCKET_URL), (configured, "config")] {
        let Some(raw) = candidate.filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        match normalize_socket_url(raw) {
            Ok(url) => return Ok(url),
            Err(e) => tracing::warn!(origin, input = raw, error = %e, "Ignoring invalid socket URL"),
        }
    }
    backend.socket_url()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_normalize_bare_host() {
        let url = normalize_url("192.168.2.1").unwrap();
        assert_eq!(url.as_str(), "http://192.168.2.1:8000/");
    }

    #[test]
    fn test_normalize_keeps_explicit_port() {
        let url = normalize_url("http://localhost:8080").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn test_normalize_https_gets_backend_port() {
        let url = normalize_url("https://rig.example.com").unwrap();
        assert_eq!(url.as_str(), "https://rig.example.com:8000/");
    }

    #[test]
    fn test_normalize_ipv6() {
        let url = normalize_url("[::1]:9000").unwrap();
        assert_eq!(url.as_str(), "http://[::1]:9000/");
    }

    #[test]
    fn test_normalize_rejects_empty_and_foreign_schemes() {
        assert_eq!(normalize_url("   ").unwrap_err(), AddressError::EmptyInput);
        assert!(matches!(
            normalize_url("ftp://example.com").unwrap_err(),
            AddressError::UnsupportedScheme(_)
        ));
        assert!(matches!(
            normalize_socket_url("http://example.com").unwrap_err(),
            AddressError::UnsupportedScheme(_)
        ));
    }

    #[test]
    fn test_endpoint_join() {
        let addr = BackendAddress::parse("localhost", AddressSource::UserInput).unwrap();
        assert_eq!(addr.endpoint("/send_command/"), "http://localhost:8000/send_command/");
        assert_eq!(addr.endpoint("device_data/lcu"), "http://localhost:8000/device_data/lcu");
    }

    #[test]
    fn test_socket_url_follows_tls() {
        let plain = BackendAddress::parse("10.0.0.5:8000", AddressSource::Config).unwrap();
        assert_eq!(plain.socket_url().unwrap().as_str(), "ws://10.0.0.5:8000/ws");

        let tls = BackendAddress::parse("https://rig.local:8443", AddressSource::Config).unwrap();
        assert_eq!(tls.socket_url().unwrap().as_str(), "wss://rig.local:8443/ws");
    }

    #[test]
    fn test_from_host_brackets_ipv6() {
        let addr = BackendAddress::from_host("::1", 8000, AddressSource::PageHost).unwrap();
        assert_eq!(addr.as_str(), "http://[::1]:8000/");
    }

    #[test]
    fn test_default_address() {
        let addr = BackendAddress::default();
        assert_eq!(addr.as_str(), "http://localhost:8000/");
        assert_eq!(addr.source(), AddressSource::Default);
        assert_eq!(normalize_url(DEFAULT_BACKEND_URL).unwrap().as_str(), addr.as_str());
    }

    #[test]
    fn test_address_source_priority() {
        assert!(AddressSource::UserInput.priority() > AddressSource::Environment.priority());
        assert!(AddressSource::Environment.priority() > AddressSource::Config.priority());
        assert!(AddressSource::Config.priority() > AddressSource::PageHost.priority());
        assert!(AddressSource::PageHost.priority() > AddressSource::Default.priority());
    }

    #[test]
    #[serial]
    fn test_resolve_address_default() {
        std::env::remove_var(ENV_API_URL);
        let addr = resolve_address(&AddressInputs::default());
        assert_eq!(addr.source(), AddressSource::Default);
    }

    #[test]
    #[serial]
    fn test_resolve_address_env_beats_config() {
        std::env::set_var(ENV_API_URL, "http://env.local:9999");
        let addr = resolve_address(&AddressInputs {
            config_url: Some("http://config.local:7000"),
            ..AddressInputs::default()
        });
        assert_eq!(addr.as_str(), "http://env.local:9999/");
        assert_eq!(addr.source(), AddressSource::Environment);
        std::env::remove_var(ENV_API_URL);
    }

    #[test]
    #[serial]
    fn test_resolve_address_user_input_priority() {
        std::env::set_var(ENV_API_URL, "http://env.local:9999");
        let addr = resolve_address(&AddressInputs {
            user_input: Some("user.local:7777"),
            ..AddressInputs::default()
        });
        assert_eq!(addr.as_str(), "http://user.local:7777/");
        assert_eq!(addr.source(), AddressSource::UserInput);
        std::env::remove_var(ENV_API_URL);
    }

    #[test]
    #[serial]
    fn test_resolve_address_host_hint_uses_port() {
        std::env::remove_var(ENV_API_URL);
        let addr = resolve_address(&AddressInputs {
            host_hint: Some("192.168.2.1"),
            port: Some(8000),
            ..AddressInputs::default()
        });
        assert_eq!(addr.as_str(), "http://192.168.2.1:8000/");
        assert_eq!(addr.source(), AddressSource::PageHost);
    }

    #[test]
    #[serial]
    fn test_resolve_address_skips_invalid_candidates() {
        std::env::remove_var(ENV_API_URL);
        let addr = resolve_address(&AddressInputs {
            user_input: Some("ftp://nope"),
            config_url: Some("config.local"),
            ..AddressInputs::default()
        });
        assert_eq!(addr.source(), AddressSource::Config);
    }

    #[test]
    #[serial]
    fn test_resolve_socket_url_precedence() {
        let backend = BackendAddress::parse("rig.local", AddressSource::Config).unwrap();

        std::env::remove_var(ENV_WEBSOCKET_URL);
        assert_eq!(
            resolve_socket_url(None, &backend).unwrap().as_str(),
            "ws://rig.local:8000/ws"
        );
        assert_eq!(
            resolve_socket_url(Some("ws://other:9001/socket"), &backend).unwrap().as_str(),
            "ws://other:9001/socket"
        );

        std::env::set_var(ENV_WEBSOCKET_URL, "wss://env.local/ws");
        assert_eq!(
            resolve_socket_url(Some("ws://other:9001/socket"), &backend).unwrap().as_str(),
            "wss://env.local:8000/ws"
        );
        std::env::remove_var(ENV_WEBSOCKET_URL);
    }

    #[test]
    fn test_address_error_display() {
        assert_eq!(AddressError::EmptyInput.to_string(), "Address cannot be empty");
        assert!(AddressError::UnsupportedScheme("ftp".to_string())
            .to_string()
            .contains("ftp"));
    }
}
