//! Mock Backend
//!
//! In-memory stand-in for the control backend. It records every request, so tests can use
//! it as a spy on the dispatcher, and it can be told to fail, answer slowly or report
//! missing telemetry.
//!
//! # Failure Injection
//!
//! - [`MockBackend::fail_commands_for`] - `send_command` for one device returns an error
//! - [`MockBackend::reject_commands_for`] - `send_command` answers `success: false`
//! - [`MockBackend::set_status_failing`] - `GET /device_status/` errors (poll ticks fail)
//! - [`MockBackend::set_run_creation_failing`] - run creation errors
//! - [`MockBackend::set_latency`] - per-endpoint delay using `tokio::time::sleep`
//!
//! Device data starts out missing (404) until [`MockBackend::set_device_data`] is called.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::{Backend, CommandResponse, NewRun, RunRecord, RunStop};
use crate::error::{HmiError, Result};
use crate::protocol::{CommandRequest, DeviceId};

/// Endpoint selector for latency injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `POST /send_command/`
    SendCommand,
    /// `POST /emergency_stop`
    EmergencyStop,
    /// `GET /device_status/`
    DeviceStatus,
    /// `GET /device_data/{device}`
    DeviceData,
    /// `GET /device_data/`
    AllDeviceData,
    /// `POST /projects/{p}/experiments/{e}/runs`
    CreateRun,
    /// `POST /runs/{id}/stop`
    StopRun,
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    /// A command was sent
    SendCommand(CommandRequest),
    /// Emergency stop was requested
    EmergencyStop,
    /// Status snapshot was requested
    DeviceStatus,
    /// Telemetry for one device was requested
    DeviceData(DeviceId),
    /// Bulk telemetry was requested
    AllDeviceData,
    /// A run was created
    CreateRun {
        /// Project id
        project_id: i64,
        /// Experiment id
        experiment_id: i64,
        /// Request body
        run: NewRun,
    },
    /// A run was closed
    StopRun {
        /// Run id
        run_id: i64,
        /// Request body
        stop: RunStop,
    },
}

impl RecordedCall {
    fn endpoint(&self) -> Endpoint {
        match self {
            Self::SendCommand(_) => Endpoint::SendCommand,
            Self::EmergencyStop => Endpoint::EmergencyStop,
            Self::DeviceStatus => Endpoint::DeviceStatus,
            Self::DeviceData(_) => Endpoint::DeviceData,
            Self::AllDeviceData => Endpoint::AllDeviceData,
            Self::CreateRun { .. } => Endpoint::CreateRun,
            Self::StopRun { .. } => Endpoint::StopRun,
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    failing_devices: HashSet<DeviceId>,
    rejecting_devices: HashSet<DeviceId>,
    status_failing: bool,
    bulk_data_failing: bool,
    run_creation_failing: bool,
    emergency_stop_missing: bool,
    latency: HashMap<Endpoint, Duration>,
    device_status: Option<Value>,
    device_data: HashMap<DeviceId, Value>,
}

/// Recording in-memory backend.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackend::new();
/// backend.fail_commands_for(DeviceId::Dcu);
/// dispatcher.send(DeviceId::Dcu, CommandMode::Idle, &CommandParams::default()).await;
/// assert_eq!(backend.sent_commands().len(), 1);
/// ```
pub struct MockBackend {
    state: Mutex<MockState>,
    next_run_id: AtomicI64,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Healthy backend reporting all three devices online.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_run_id: AtomicI64::new(1),
        }
    }

    /// Every request so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Every command sent so far, in arrival order.
    #[must_use]
    pub fn sent_commands(&self) -> Vec<CommandRequest> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::SendCommand(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of requests that hit `endpoint`.
    #[must_use]
    pub fn call_count(&self, endpoint: Endpoint) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.endpoint() == endpoint)
            .count()
    }

    /// Forget recorded calls (injected behavior is kept).
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make `send_command` for `device` fail with a transport error.
    pub fn fail_commands_for(&self, device: DeviceId) {
        self.state.lock().failing_devices.insert(device);
    }

    /// Make `send_command` for `device` answer `success: false`.
    pub fn reject_commands_for(&self, device: DeviceId) {
        self.state.lock().rejecting_devices.insert(device);
    }

    /// Undo command failure injection for every device.
    pub fn heal_commands(&self) {
        let mut state = self.state.lock();
        state.failing_devices.clear();
        state.rejecting_devices.clear();
    }

    /// Make `GET /device_status/` fail.
    pub fn set_status_failing(&self, failing: bool) {
        self.state.lock().status_failing = failing;
    }

    /// Make `GET /device_data/` fail.
    pub fn set_bulk_data_failing(&self, failing: bool) {
        self.state.lock().bulk_data_failing = failing;
    }

    /// Make run creation fail.
    pub fn set_run_creation_failing(&self, failing: bool) {
        self.state.lock().run_creation_failing = failing;
    }

    /// Answer `POST /emergency_stop` with 404, like a backend without that route.
    pub fn set_emergency_stop_missing(&self, missing: bool) {
        self.state.lock().emergency_stop_missing = missing;
    }

    /// Delay every call to `endpoint` by `delay`.
    pub fn set_latency(&self, endpoint: Endpoint, delay: Duration) {
        self.state.lock().latency.insert(endpoint, delay);
    }

    /// Replace the status snapshot returned by `GET /device_status/`.
    pub fn set_device_status(&self, snapshot: Value) {
        self.state.lock().device_status = Some(snapshot);
    }

    /// Provide telemetry for `device`; before this its endpoint answers 404.
    pub fn set_device_data(&self, device: DeviceId, data: Value) {
        self.state.lock().device_data.insert(device, data);
    }

    async fn enter(&self, call: RecordedCall) {
        let endpoint = call.endpoint();
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.latency.get(&endpoint).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn default_status() -> Value {
        let now = Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let devices: Vec<Value> = DeviceId::ALL
            .iter()
            .map(|device| {
                json!({
                    "device": device.as_str(),
                    "status": "online",
                    "last_seen": now,
                    "data_count": 0,
                })
            })
            .collect();
        json!({ "devices": devices, "timestamp": now })
    }
}

fn injected(what: &str) -> HmiError {
    HmiError::HttpStatus {
        status: 503,
        body: format!("injected failure: {what}"),
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn send_command(&self, request: &CommandRequest) -> Result<CommandResponse> {
        self.enter(RecordedCall::SendCommand(request.clone())).await;
        let state = self.state.lock();
        if state.failing_devices.contains(&request.device) {
            return Err(injected("send_command"));
        }
        if state.rejecting_devices.contains(&request.device) {
            return Ok(CommandResponse::rejected(format!(
                "{} did not acknowledge",
                request.device
            )));
        }
        Ok(CommandResponse::ok(format!("Command sent to {}", request.device)))
    }

    async fn emergency_stop(&self) -> Result<CommandResponse> {
        self.enter(RecordedCall::EmergencyStop).await;
        if self.state.lock().emergency_stop_missing {
            return Err(HmiError::HttpStatus {
                status: 404,
                body: "Not Found".to_string(),
            });
        }
        Ok(CommandResponse::ok("Emergency stop sent to all devices"))
    }

    async fn device_status(&self) -> Result<Value> {
        self.enter(RecordedCall::DeviceStatus).await;
        let state = self.state.lock();
        if state.status_failing {
            return Err(injected("device_status"));
        }
        Ok(state
            .device_status
            .clone()
            .unwrap_or_else(Self::default_status))
    }

    async fn device_data(&self, device: DeviceId) -> Result<Option<Value>> {
        self.enter(RecordedCall::DeviceData(device)).await;
        let state = self.state.lock();
        Ok(state.device_data.get(&device).map(|data| {
            json!({
                "device": device.as_str(),
                "data": data,
                "timestamp": Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            })
        }))
    }

    async fn all_device_data(&self) -> Result<Value> {
        self.enter(RecordedCall::AllDeviceData).await;
        let state = self.state.lock();
        if state.bulk_data_failing {
            return Err(injected("device_data"));
        }
        let devices: serde_json::Map<String, Value> = state
            .device_data
            .iter()
            .map(|(device, data)| (device.as_str().to_string(), data.clone()))
            .collect();
        Ok(json!({ "devices": devices }))
    }

    async fn create_run(
        &self,
        project_id: i64,
        experiment_id: i64,
        run: &NewRun,
    ) -> Result<RunRecord> {
        self.enter(RecordedCall::CreateRun {
            project_id,
            experiment_id,
            run: run.clone(),
        })
        .await;
        if self.state.lock().run_creation_failing {
            return Err(HmiError::RunRecord("injected failure: create_run".to_string()));
        }
        Ok(RunRecord {
            run_id: self.next_run_id.fetch_add(1, Ordering::SeqCst),
            project_id,
            experiment_id,
            run_name: run.run_name.clone(),
            run_status: run.run_status.clone(),
            start_time: run.start_time.map(|t| t.to_rfc3339()),
            stop_time: None,
        })
    }

    async fn stop_run(&self, run_id: i64, stop: &RunStop) -> Result<()> {
        self.enter(RecordedCall::StopRun {
            run_id,
            stop: stop.clone(),
        })
        .await;
        Ok(())
    }
}
