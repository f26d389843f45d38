//! # Rig HMI Core Library
//!
//! Device-communication core for the operator console of a small motion-control rig:
//! a linear-actuator unit (LCU), a drill/contactor unit (DCU) and a sensor unit (SDU).
//! It keeps one live connection to the control backend, decodes device status and
//! telemetry into typed events, and decides when and what to send to the hardware.
//!
//! ## Crate Structure
//!
//! - **`config`**: `HmiConfig`, loaded with figment from defaults, `config/hmi.toml` and
//!   `RIG_HMI_*` environment variables.
//! - **`connection`**: backend address normalization and precedence, socket URL derivation.
//! - **`protocol`**: device ids, logical modes and directions, the versioned numeric
//!   encoding (`ProtocolTable`), target clamping and the `send_command` payload.
//! - **`backend`**: the `Backend` trait for the REST boundary, with a hyper client and an
//!   in-memory mock.
//! - **`transport`**: `TransportManager` with push (WebSocket) and pull (polling)
//!   strategies, typed event bus, reconnect policy.
//! - **`dispatcher`**: `CommandDispatcher`, one backend call per command.
//! - **`control`**: `ControlSession`, the operator state machine (debounced auto-send,
//!   change suppression, safety gating, start/stop/emergency stop, experiment runs).
//! - **`status`**: `DeviceStatusAggregator` and the overall summary.
//! - **`error`**: the `HmiError` enum.
//! - **`tracing_init`**: subscriber setup.
//!
//! ## Data flow
//!
//! ```text
//! operator ─> ControlSession ─> CommandDispatcher ─> Backend ─> units
//! units ─> backend ─> TransportManager ─> DeviceStatusAggregator / subscribers
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod status;
pub mod tracing_init;
pub mod transport;

pub use backend::{Backend, HttpBackend, MockBackend};
pub use config::HmiConfig;
pub use connection::BackendAddress;
pub use control::ControlSession;
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use error::{HmiError, Result};
pub use status::DeviceStatusAggregator;
pub use transport::{ConnectionStatus, TransportManager};
