//! Command Dispatcher
//!
//! Turns a logical `(device, mode, params)` triple into the `send_command` payload and
//! performs exactly one backend call. Failures come back as a [`DispatchOutcome`] with
//! `success = false`; nothing is retried here.
//!
//! With the single-in-flight discipline enabled, a second non-idle command for a device
//! whose previous command is still outstanding is rejected immediately instead of being
//! queued. Idle commands always pass so a stop is never turned away.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::HmiError;
use crate::protocol::{Command, CommandMode, CommandParams, DeviceId, ProtocolTable, TargetLimits};

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    /// Backend accepted the command
    pub success: bool,
    /// Backend message or failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DispatchOutcome {
    /// Backend accepted the command.
    #[must_use]
    pub fn sent(message: Option<String>) -> Self {
        Self {
            success: true,
            message,
        }
    }

    /// Transport failure or backend rejection.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    /// Rejected locally: a command for this device is still in flight.
    #[must_use]
    pub fn busy(device: DeviceId) -> Self {
        Self::failed(format!("{} command already in flight", device.label()))
    }

    /// Rejected locally: the device takes no commands.
    #[must_use]
    pub fn not_commandable(device: DeviceId) -> Self {
        Self::failed(format!("{} does not accept commands", device.label()))
    }
}

/// Releases a device's in-flight slot on drop, including when the send is cancelled.
struct InFlight {
    slots: Arc<Mutex<HashSet<DeviceId>>>,
    device: DeviceId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.device);
    }
}

/// Sends logical commands through a [`Backend`].
#[derive(Clone)]
pub struct CommandDispatcher {
    backend: Arc<dyn Backend>,
    table: ProtocolTable,
    limits: TargetLimits,
    single_in_flight: bool,
    in_flight: Arc<Mutex<HashSet<DeviceId>>>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("revision", &self.table.revision)
            .field("single_in_flight", &self.single_in_flight)
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// New dispatcher; single-in-flight is off until enabled.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, table: ProtocolTable, limits: TargetLimits) -> Self {
        Self {
            backend,
            table,
            limits,
            single_in_flight: false,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Enable or disable the per-device single-in-flight guard.
    #[must_use]
    pub fn with_single_in_flight(mut self, enabled: bool) -> Self {
        self.single_in_flight = enabled;
        self
    }

    /// Encoding table in use.
    #[must_use]
    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Target limits in use.
    #[must_use]
    pub fn limits(&self) -> &TargetLimits {
        &self.limits
    }

    /// Whether a command for `device` is outstanding.
    #[must_use]
    pub fn is_in_flight(&self, device: DeviceId) -> bool {
        self.in_flight.lock().contains(&device)
    }

    /// Encode and send one command. Never returns an error.
    pub async fn send(
        &self,
        device: DeviceId,
        mode: CommandMode,
        params: &CommandParams,
    ) -> DispatchOutcome {
        self.dispatch(&Command::new(device, mode, params)).await
    }

    /// Send an already-built command.
    pub async fn dispatch(&self, command: &Command) -> DispatchOutcome {
        let device = command.device;
        let request = match command.encode(&self.table, &self.limits) {
            Ok(request) => request,
            Err(HmiError::NotCommandable(_)) => {
                debug!(%device, "Refusing command for telemetry-only device");
                return DispatchOutcome::not_commandable(device);
            }
            Err(e) => {
                warn!(%device, error = %e, "Command does not encode");
                return DispatchOutcome::failed(e.to_string());
            }
        };

        let _slot = if self.single_in_flight && !command.mode.is_idle() {
            match self.acquire(device) {
                Some(slot) => Some(slot),
                None => {
                    debug!(%device, mode = %command.mode, "Rejected: command in flight");
                    return DispatchOutcome::busy(device);
                }
            }
        } else {
            None
        };

        debug!(
            %device,
            mode = %command.mode,
            code = request.command.mode,
            direction = request.command.direction,
            target = request.command.target,
            "Sending command"
        );
        match self.backend.send_command(&request).await {
            Ok(response) if response.success => {
                info!(%device, mode = %command.mode, "Command accepted");
                DispatchOutcome::sent(response.message)
            }
            Ok(response) => {
                let message = response
                    .message
                    .unwrap_or_else(|| "Command rejected by backend".to_string());
                warn!(%device, %message, "Command rejected");
                DispatchOutcome::failed(message)
            }
            Err(e) => {
                warn!(%device, error = %e, "Command failed");
                DispatchOutcome::failed(e.to_string())
            }
        }
    }

    /// Idle command for `device`.
    pub async fn idle(&self, device: DeviceId) -> DispatchOutcome {
        self.dispatch(&Command::idle(device)).await
    }

    /// `POST /emergency_stop`. Bypasses the in-flight guard.
    pub async fn emergency_stop(&self) -> DispatchOutcome {
        match self.backend.emergency_stop().await {
            Ok(response) if response.success => DispatchOutcome::sent(response.message),
            Ok(response) => DispatchOutcome::failed(
                response
                    .message
                    .unwrap_or_else(|| "Emergency stop rejected".to_string()),
            ),
            Err(e) => {
                warn!(error = %e, "Emergency stop failed");
                DispatchOutcome::failed(e.to_string())
            }
        }
    }

    fn acquire(&self, device: DeviceId) -> Option<InFlight> {
        self.in_flight.lock().insert(device).then(|| InFlight {
            slots: Arc::clone(&self.in_flight),
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Endpoint, MockBackend};
    use crate::protocol::Direction;
    use std::time::Duration;

    fn dispatcher(mock: &Arc<MockBackend>) -> CommandDispatcher {
        CommandDispatcher::new(
            Arc::clone(mock) as Arc<dyn Backend>,
            ProtocolTable::default(),
            TargetLimits::default(),
        )
    }

    #[tokio::test]
    async fn sends_one_encoded_command() {
        let mock = Arc::new(MockBackend::new());
        let outcome = dispatcher(&mock)
            .send(
                DeviceId::Lcu,
                CommandMode::RunContinuous,
                &CommandParams::motion(Direction::Forward, 150.0),
            )
            .await;

        assert!(outcome.success);
        let sent = mock.sent_commands();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command.mode, 2);
        assert_eq!(sent[0].command.direction, 2);
        assert_eq!(sent[0].command.target, 100.0);
        assert_eq!(sent[0].command.run_id, 0);
    }

    #[tokio::test]
    async fn sdu_is_refused_without_a_call() {
        let mock = Arc::new(MockBackend::new());
        let outcome = dispatcher(&mock).idle(DeviceId::Sdu).await;
        assert!(!outcome.success);
        assert_eq!(mock.call_count(Endpoint::SendCommand), 0);
    }

    #[tokio::test]
    async fn invalid_direction_is_refused_without_a_call() {
        let mock = Arc::new(MockBackend::new());
        let outcome = dispatcher(&mock)
            .send(
                DeviceId::Dcu,
                CommandMode::RunContinuous,
                &CommandParams::motion(Direction::Forward, 5.0),
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(mock.call_count(Endpoint::SendCommand), 0);
    }

    #[tokio::test]
    async fn transport_failure_becomes_outcome() {
        let mock = Arc::new(MockBackend::new());
        mock.fail_commands_for(DeviceId::Dcu);
        let outcome = dispatcher(&mock).idle(DeviceId::Dcu).await;
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("injected failure"));

        mock.reject_commands_for(DeviceId::Lcu);
        assert!(!dispatcher(&mock).idle(DeviceId::Lcu).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn single_in_flight_rejects_overlap_but_not_idle() {
        let mock = Arc::new(MockBackend::new());
        mock.set_latency(Endpoint::SendCommand, Duration::from_millis(100));
        let dispatcher = dispatcher(&mock).with_single_in_flight(true);
        let params = CommandParams::motion(Direction::Forward, 10.0);

        let first = {
            let d = dispatcher.clone();
            tokio::spawn(async move {
                d.send(DeviceId::Lcu, CommandMode::RunContinuous, &params)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(dispatcher.is_in_flight(DeviceId::Lcu));

        let second = dispatcher
            .send(DeviceId::Lcu, CommandMode::RunContinuous, &params)
            .await;
        assert_eq!(second, DispatchOutcome::busy(DeviceId::Lcu));

        // Other device and idle commands are unaffected.
        assert!(dispatcher.idle(DeviceId::Lcu).await.success);
        assert!(dispatcher
            .send(
                DeviceId::Dcu,
                CommandMode::RunContinuous,
                &CommandParams::motion(Direction::Clockwise, 12.0)
            )
            .await
            .success);

        assert!(first.await.unwrap().success);
        assert!(!dispatcher.is_in_flight(DeviceId::Lcu));
    }
}
