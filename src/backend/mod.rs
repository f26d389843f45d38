//! Control Backend Boundary
//!
//! The control backend is an external REST service that forwards commands to the units
//! and exposes their connectivity and telemetry. Everything the HMI core needs from it is
//! captured by the [`Backend`] trait:
//!
//! | Operation | Endpoint |
//! |---|---|
//! | [`Backend::send_command`] | `POST /send_command/` |
//! | [`Backend::emergency_stop`] | `POST /emergency_stop` |
//! | [`Backend::device_status`] | `GET /device_status/` |
//! | [`Backend::device_data`] | `GET /device_data/{device}` |
//! | [`Backend::all_device_data`] | `GET /device_data/` |
//! | [`Backend::create_run`] | `POST /projects/{p}/experiments/{e}/runs` |
//! | [`Backend::stop_run`] | `POST /runs/{id}/stop` |
//!
//! Two implementations ship with the crate:
//!
//! - [`HttpBackend`] - hyper client against a live backend
//! - [`MockBackend`] - in-memory backend that records calls (tests, `--mock`)
//!
//! # Thread Safety
//!
//! Implementations are shared as `Arc<dyn Backend>` between the transport poll loop,
//! the dispatcher and the control session, so they must be `Send + Sync` and use
//! interior mutability for any state.

mod http;
pub mod mock;

pub use http::HttpBackend;
pub use mock::MockBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{CommandRequest, DeviceId};

/// Response of the command endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the backend accepted the command
    pub success: bool,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Endpoint-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    /// Successful response with a message.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Rejected response with a message.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Body of the run-creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    /// Run name
    pub run_name: String,
    /// Optional free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_description: Option<String>,
    /// Parameter snapshot for the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_params: Option<Value>,
    /// Initial status (`"running"` when started from the control session)
    pub run_status: String,
    /// Start timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

/// Run record returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Backend-assigned identifier
    pub run_id: i64,
    /// Owning project
    pub project_id: i64,
    /// Owning experiment
    pub experiment_id: i64,
    /// Run name
    pub run_name: String,
    /// Current status
    #[serde(default)]
    pub run_status: String,
    /// Start timestamp as reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Stop timestamp as reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<String>,
}

/// Body of the run-stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Final status (`"completed"`, `"aborted"`)
    pub status: String,
    /// Optional operator notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RunStop {
    /// Normal completion.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: "completed".to_string(),
            notes: None,
        }
    }

    /// Termination by emergency stop.
    #[must_use]
    pub fn aborted(notes: impl Into<String>) -> Self {
        Self {
            status: "aborted".to_string(),
            notes: Some(notes.into()),
        }
    }
}

/// REST boundary of the control backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Forward one encoded command to a unit.
    async fn send_command(&self, request: &CommandRequest) -> Result<CommandResponse>;

    /// Ask the backend to stop every unit.
    async fn emergency_stop(&self) -> Result<CommandResponse>;

    /// Per-device connectivity snapshot.
    async fn device_status(&self) -> Result<Value>;

    /// Latest telemetry for one device, `None` when the backend has none (404).
    async fn device_data(&self, device: DeviceId) -> Result<Option<Value>>;

    /// Latest telemetry for every device.
    async fn all_device_data(&self) -> Result<Value>;

    /// Create a run record under an experiment.
    async fn create_run(
        &self,
        project_id: i64,
        experiment_id: i64,
        run: &NewRun,
    ) -> Result<RunRecord>;

    /// Close a run record.
    async fn stop_run(&self, run_id: i64, stop: &RunStop) -> Result<()>;
}
