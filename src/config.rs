//! Configuration System using Figment
//!
//! Strongly-typed configuration for the device-communication layer. Values are layered:
//! 1. Built-in defaults (every field has one, so an empty file is valid)
//! 2. `config/hmi.toml` (optional)
//! 3. Environment variables prefixed with `RIG_HMI_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use rig_hmi::config::HmiConfig;
//!
//! // RIG_HMI_TRANSPORT__POLL_INTERVAL_MS=500 overrides transport.poll_interval_ms
//! let config = HmiConfig::load()?;
//! config.validate()?;
//! println!("Polling every {:?}", config.transport.poll_interval());
//! # Ok::<(), rig_hmi::error::HmiError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::{self, AddressInputs, BackendAddress};
use crate::error::{HmiError, Result};
use crate::protocol::{
    DcuDirectionCodes, FirmwareRevision, LcuDirectionCodes, ModeCodes, ProtocolTable,
    TargetLimits,
};
use crate::tracing_init::{self, OutputFormat};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/hmi.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RIG_HMI_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HmiConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Control backend location
    pub backend: BackendConfig,
    /// Transport strategy and retry policy
    pub transport: TransportConfig,
    /// Control session timing
    pub control: ControlConfig,
    /// Target clamp bounds
    pub limits: TargetLimits,
    /// Numeric encoding of modes and directions
    pub protocol: ProtocolConfig,
    /// Device staleness thresholds
    pub health: HealthThresholds,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Compact,
        }
    }
}

/// Control backend location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Full base URL; wins over `host`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bare host combined with `port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Backend port
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: connection::DEFAULT_BACKEND_PORT,
        }
    }
}

/// Which transport strategy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Fixed-interval REST polling
    #[default]
    Pull,
    /// Persistent WebSocket
    Push,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull" | "poll" | "polling" => Ok(Self::Pull),
            "push" | "ws" | "websocket" => Ok(Self::Push),
            other => Err(format!("unknown strategy '{other}' (expected pull or push)")),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Strategy to run
    pub strategy: StrategyKind,
    /// Explicit socket URL for the push strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    /// Pull: interval between ticks
    pub poll_interval_ms: u64,
    /// Pull: consecutive failed ticks before settling in `error`
    pub max_retries: u32,
    /// Pull: upper bound of the retry backoff
    pub backoff_cap_ms: u64,
    /// Push: base reconnect delay
    pub reconnect_interval_ms: u64,
    /// Push: consecutive failed connections before settling in `error`
    pub max_reconnect_attempts: u32,
    /// Add random jitter to reconnect delays
    pub jitter: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Pull,
            socket_url: None,
            poll_interval_ms: 2000,
            max_retries: 5,
            backoff_cap_ms: 10_000,
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 10,
            jitter: false,
        }
    }
}

impl TransportConfig {
    /// Poll interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff cap as a `Duration`.
    #[must_use]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Base reconnect delay as a `Duration`.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Control session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Delay before an auto-sent change is transmitted
    pub debounce_ms: u64,
    /// Lifetime of transient action notices
    pub notice_ttl_ms: u64,
    /// Send direction/target changes automatically while running in manual mode
    pub execute_on_change: bool,
    /// Reject new commands for a device while one is in flight
    pub single_in_flight: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            notice_ttl_ms: 3000,
            execute_on_change: true,
            single_in_flight: true,
        }
    }
}

impl ControlConfig {
    /// Debounce delay as a `Duration`.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Notice lifetime as a `Duration`.
    #[must_use]
    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }
}

/// Protocol encoding: a revision preset plus optional per-table overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Preset the table starts from
    pub revision: FirmwareRevision,
    /// Replaces the preset's mode codes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modes: Option<ModeCodes>,
    /// Replaces the preset's LCU direction codes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcu_directions: Option<LcuDirectionCodes>,
    /// Replaces the preset's DCU direction codes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dcu_directions: Option<DcuDirectionCodes>,
}

impl ProtocolConfig {
    /// Effective protocol table.
    #[must_use]
    pub fn table(&self) -> ProtocolTable {
        let mut table = ProtocolTable::for_revision(self.revision);
        if let Some(modes) = self.modes {
            table.modes = modes;
        }
        if let Some(codes) = self.lcu_directions {
            table.lcu_directions = codes;
        }
        if let Some(codes) = self.dcu_directions {
            table.dcu_directions = codes;
        }
        table
    }
}

/// Silence thresholds after which a device is downgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Silent longer than this: `warning`
    pub warning_after_secs: u64,
    /// Silent longer than this: `offline`
    pub offline_after_secs: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_after_secs: 45,
            offline_after_secs: 60,
        }
    }
}

impl HmiConfig {
    /// Load configuration from `config/hmi.toml` and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The layered figment, exposed for callers that add their own providers.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HmiConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(HmiError::Configuration)
    }

    fn check(&self) -> std::result::Result<(), String> {
        tracing_init::parse_log_level(&self.logging.level)?;

        if self.transport.poll_interval_ms == 0 {
            return Err("transport.poll_interval_ms must be greater than 0".to_string());
        }
        if self.transport.max_retries == 0 {
            return Err("transport.max_retries must be greater than 0".to_string());
        }
        if self.transport.max_reconnect_attempts == 0 {
            return Err("transport.max_reconnect_attempts must be greater than 0".to_string());
        }
        if self.transport.backoff_cap_ms < self.transport.poll_interval_ms {
            return Err(format!(
                "transport.backoff_cap_ms ({}) must be >= poll_interval_ms ({})",
                self.transport.backoff_cap_ms, self.transport.poll_interval_ms
            ));
        }
        if self.control.debounce_ms == 0 {
            return Err("control.debounce_ms must be greater than 0".to_string());
        }

        self.limits.validate()?;
        self.protocol
            .table()
            .validate()
            .map_err(|e| format!("protocol: {e}"))?;

        if self.health.warning_after_secs >= self.health.offline_after_secs {
            return Err(format!(
                "health.warning_after_secs ({}) must be less than offline_after_secs ({})",
                self.health.warning_after_secs, self.health.offline_after_secs
            ));
        }

        Ok(())
    }

    /// Resolve the backend address, letting `user_input` override every other source.
    #[must_use]
    pub fn backend_address(&self, user_input: Option<&str>) -> BackendAddress {
        connection::resolve_address(&AddressInputs {
            user_input,
            config_url: self.backend.url.as_deref(),
            host_hint: self.backend.host.as_deref(),
            port: Some(self.backend.port),
        })
    }
}
