//! Control Session
//!
//! Operator-facing state machine for the two commandable units plus session-level
//! orchestration: manual runs, experiment runs and emergency stop.
//!
//! ```text
//!            start_manual / start_experiment
//!   Stopped ─────────────────────────────────> Running
//!      ▲  ▲                                       │
//!      │  └──── stop (all idle commands ok) ──────┤
//!      │                                          │
//!   DegradedStop <── stop (an idle command failed)┘
//! ```
//!
//! Per unit: `Idle ⇄ Commanded`, with `Stopping` while an idle command is in flight.
//!
//! # Guarantees
//!
//! - **Gating**: while the session is stopped (or degraded-stopped) no non-idle command
//!   reaches the dispatcher. The check happens at send time, not when the change is made.
//! - **Change detection**: [`ControlSession::execute_unit`] suppresses a send identical to
//!   the last acknowledged one.
//! - **Debounce**: with execute-on-change enabled, manual changes while running are sent
//!   once per burst after `debounce_ms`.
//! - **Stop first**: stop and emergency stop flip the session state before any network
//!   call; a failed idle command never reverts it, it only marks the stop degraded.
//!
//! None of the actions return transport errors. Failures are logged and shown as
//! transient [`ActionNotice`]s.

pub mod debounce;

pub use debounce::Debouncer;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, NewRun, RunRecord, RunStop};
use crate::config::{ControlConfig, HmiConfig};
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::error::{HmiError, Result};
use crate::protocol::{CommandMode, CommandParams, DeviceId, Direction};

/// Which workflow drives the units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// Operator jogs the units directly
    #[default]
    Manual,
    /// Units run under an experiment run record
    Experiment,
}

/// Top-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No motion commanded
    #[default]
    Stopped,
    /// Units commanded
    Running,
    /// Stopped, but at least one idle command was not acknowledged
    DegradedStop,
}

impl SessionStatus {
    /// `true` for `Stopped` and `DegradedStop`.
    #[must_use]
    pub fn is_stopped(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-unit phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitPhase {
    /// No motion commanded
    #[default]
    Idle,
    /// Motion command acknowledged
    Commanded,
    /// Idle command in flight
    Stopping,
}

/// Last command the backend acknowledged for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastSentCommand {
    /// Mode sent
    pub mode: CommandMode,
    /// Direction sent
    pub direction: Direction,
    /// Target sent (already clamped)
    pub target: f64,
}

/// Operator state for one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitControl {
    /// Unit
    pub device: DeviceId,
    /// Selected run mode
    pub mode: CommandMode,
    /// Selected direction
    pub direction: Direction,
    /// Selected target, clamped for `mode`
    pub target: f64,
    /// Last acknowledged command
    pub last_sent: Option<LastSentCommand>,
    /// Phase
    pub phase: UnitPhase,
}

impl UnitControl {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            mode: CommandMode::RunContinuous,
            direction: Direction::Idle,
            target: 0.0,
            last_sent: None,
            phase: UnitPhase::Idle,
        }
    }

    /// Command `execute_unit` would send: idle for a non-positive target or no direction.
    fn desired(&self) -> LastSentCommand {
        if self.target <= 0.0 || self.direction == Direction::Idle {
            LastSentCommand {
                mode: CommandMode::Idle,
                direction: Direction::Idle,
                target: 0.0,
            }
        } else {
            LastSentCommand {
                mode: self.mode,
                direction: self.direction,
                target: self.target,
            }
        }
    }
}

/// Run currently owned by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    /// Project
    pub project_id: i64,
    /// Experiment
    pub experiment_id: i64,
    /// Backend run id
    pub run_id: i64,
    /// Run name
    pub run_name: String,
}

/// Setpoint and direction a project prescribes for a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectControl {
    /// Target for the unit
    pub setpoint: f64,
    /// Direction for the unit
    pub direction: Direction,
}

/// Everything needed to start an experiment run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentStart {
    /// Project
    pub project_id: i64,
    /// Experiment
    pub experiment_id: i64,
    /// Name for the new run record
    pub run_name: String,
    /// Optional description
    pub run_description: Option<String>,
    /// Parameter snapshot stored with the run
    pub run_params: Option<Value>,
    /// LCU override
    pub lcu: Option<ProjectControl>,
    /// DCU override
    pub dcu: Option<ProjectControl>,
}

/// Kind of transient notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Command in flight
    Sending,
    /// Command acknowledged
    Sent,
    /// Command failed
    Failed,
    /// Stop acknowledged
    Stopped,
    /// Stop not acknowledged
    StopFailed,
    /// Emergency stop issued
    EmergencyStop,
}

impl NoticeKind {
    /// Operator-facing text.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Sending => "Sending...",
            Self::Sent => "Sent",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::StopFailed => "Stop failed",
            Self::EmergencyStop => "Emergency stop",
        }
    }
}

/// Transient, self-clearing action status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionNotice {
    /// Unit the action concerned, or `None` for session-wide actions
    pub device: Option<DeviceId>,
    /// What happened
    pub kind: NoticeKind,
    /// Monotonic id; a newer notice for the same slot replaces an older one
    pub id: u64,
}

/// Notices currently shown, keyed by unit (`None` = session-wide).
pub type NoticeBoard = HashMap<Option<DeviceId>, ActionNotice>;

/// Result of [`ControlSession::execute_unit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Identical to the last acknowledged command; nothing sent
    Suppressed,
    /// Session is stopped; nothing sent
    Blocked,
    /// Sent; outcome from the dispatcher
    Sent(DispatchOutcome),
}

/// Outcomes of a two-unit action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcomes {
    /// LCU result
    pub lcu: DispatchOutcome,
    /// DCU result
    pub dcu: DispatchOutcome,
}

impl UnitOutcomes {
    /// Both units acknowledged.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.lcu.success && self.dcu.success
    }
}

/// Outcomes of [`ControlSession::emergency_stop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyOutcome {
    /// Backend-wide stop
    pub backend: DispatchOutcome,
    /// Per-unit idle commands
    pub units: UnitOutcomes,
}

impl EmergencyOutcome {
    /// Backend stop and both idle commands acknowledged.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.backend.success && self.units.all_succeeded()
    }
}

/// Cloneable view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Workflow
    pub system_mode: SystemMode,
    /// Session state
    pub status: SessionStatus,
    /// Auto-send on change
    pub execute_on_change: bool,
    /// LCU state
    pub lcu: UnitControl,
    /// DCU state
    pub dcu: UnitControl,
    /// Active experiment run
    pub active_run: Option<ActiveRun>,
}

#[derive(Debug)]
struct SessionState {
    system_mode: SystemMode,
    status: SessionStatus,
    execute_on_change: bool,
    lcu: UnitControl,
    dcu: UnitControl,
    active_run: Option<ActiveRun>,
    /// Bumped by every stop; a start that awaited across a bump is void.
    stop_epoch: u64,
}

impl SessionState {
    fn unit(&self, device: DeviceId) -> Result<&UnitControl> {
        match device {
            DeviceId::Lcu => Ok(&self.lcu),
            DeviceId::Dcu => Ok(&self.dcu),
            DeviceId::Sdu => Err(HmiError::NotCommandable(device)),
        }
    }

    fn unit_mut(&mut self, device: DeviceId) -> Result<&mut UnitControl> {
        match device {
            DeviceId::Lcu => Ok(&mut self.lcu),
            DeviceId::Dcu => Ok(&mut self.dcu),
            DeviceId::Sdu => Err(HmiError::NotCommandable(device)),
        }
    }

    fn run_params(&self) -> CommandParams {
        let mut params = CommandParams::default();
        if let Some(run) = &self.active_run {
            params = params.with_run(run.project_id, run.experiment_id, run.run_id);
        }
        params
    }
}

struct SessionInner {
    dispatcher: CommandDispatcher,
    backend: Arc<dyn Backend>,
    config: ControlConfig,
    state: Mutex<SessionState>,
    debouncer: Debouncer<DeviceId>,
    notices: watch::Sender<NoticeBoard>,
    notice_timers: Mutex<Vec<JoinHandle<()>>>,
    next_notice: AtomicU64,
}

/// Shared handle to one operator session.
#[derive(Clone)]
pub struct ControlSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl ControlSession {
    /// New session: manual mode, stopped, both units idle.
    #[must_use]
    pub fn new(dispatcher: CommandDispatcher, backend: Arc<dyn Backend>, config: ControlConfig) -> Self {
        let (notices, _) = watch::channel(NoticeBoard::new());
        Self {
            inner: Arc::new(SessionInner {
                debouncer: Debouncer::new(config.debounce()),
                state: Mutex::new(SessionState {
                    system_mode: SystemMode::Manual,
                    status: SessionStatus::Stopped,
                    execute_on_change: config.execute_on_change,
                    lcu: UnitControl::new(DeviceId::Lcu),
                    dcu: UnitControl::new(DeviceId::Dcu),
                    active_run: None,
                    stop_epoch: 0,
                }),
                dispatcher,
                backend,
                config,
                notices,
                notice_timers: Mutex::new(Vec::new()),
                next_notice: AtomicU64::new(1),
            }),
        }
    }

    /// Session wired from configuration.
    #[must_use]
    pub fn from_config(config: &HmiConfig, backend: Arc<dyn Backend>) -> Self {
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&backend),
            config.protocol.table(),
            config.limits.clone(),
        )
        .with_single_in_flight(config.control.single_in_flight);
        Self::new(dispatcher, backend, config.control.clone())
    }

    /// Dispatcher used for every send.
    #[must_use]
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.lock();
        SessionSnapshot {
            system_mode: state.system_mode,
            status: state.status,
            execute_on_change: state.execute_on_change,
            lcu: state.lcu.clone(),
            dcu: state.dcu.clone(),
            active_run: state.active_run.clone(),
        }
    }

    /// Current session state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    /// Receiver for the notice board.
    #[must_use]
    pub fn notices(&self) -> watch::Receiver<NoticeBoard> {
        self.inner.notices.subscribe()
    }

    // ---- operator inputs -------------------------------------------------

    /// Switch between manual and experiment workflows. Only allowed while stopped.
    pub fn set_system_mode(&self, mode: SystemMode) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.status.is_stopped() {
            return Err(HmiError::SessionState(format!(
                "cannot switch to {mode:?} mode while running"
            )));
        }
        state.system_mode = mode;
        Ok(())
    }

    /// Enable or disable auto-send on change.
    pub fn set_execute_on_change(&self, enabled: bool) {
        self.inner.state.lock().execute_on_change = enabled;
        if !enabled {
            self.inner.debouncer.cancel_all();
        }
    }

    /// Select the run mode for a unit; the target is re-clamped for it.
    pub fn set_mode(&self, device: DeviceId, mode: CommandMode) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let unit = state.unit_mut(device)?;
            unit.mode = mode;
            unit.target = self.inner.dispatcher.limits().clamp(device, mode, unit.target);
        }
        self.schedule_auto_send(device);
        Ok(())
    }

    /// Select a direction; rejected if the unit has no such direction.
    pub fn set_direction(&self, device: DeviceId, direction: Direction) -> Result<()> {
        let direction = direction.check(device)?;
        self.inner.state.lock().unit_mut(device)?.direction = direction;
        self.schedule_auto_send(device);
        Ok(())
    }

    /// Set a target, clamped for the unit's selected mode. Returns the stored value.
    pub fn set_target(&self, device: DeviceId, value: f64) -> Result<f64> {
        let stored = {
            let mut state = self.inner.state.lock();
            let unit = state.unit_mut(device)?;
            unit.target = self.inner.dispatcher.limits().clamp(device, unit.mode, value);
            unit.target
        };
        self.schedule_auto_send(device);
        Ok(stored)
    }

    fn schedule_auto_send(&self, device: DeviceId) {
        let armed = {
            let state = self.inner.state.lock();
            state.execute_on_change
                && state.system_mode == SystemMode::Manual
                && state.status == SessionStatus::Running
        };
        if !armed {
            return;
        }
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        self.inner.debouncer.schedule(device, async move {
            if let Some(inner) = weak.upgrade() {
                ControlSession { inner }.execute_unit(device).await;
            }
        });
    }

    // ---- sends -----------------------------------------------------------

    /// Send the unit's current selection unless it matches the last acknowledged command.
    pub async fn execute_unit(&self, device: DeviceId) -> ExecuteOutcome {
        let (desired, params) = {
            let state = self.inner.state.lock();
            let unit = match state.unit(device) {
                Ok(unit) => unit,
                Err(_) => return ExecuteOutcome::Sent(DispatchOutcome::not_commandable(device)),
            };
            let desired = unit.desired();
            if unit.last_sent == Some(desired) {
                debug!(%device, "Suppressed unchanged command");
                return ExecuteOutcome::Suppressed;
            }
            if state.status.is_stopped() && !desired.mode.is_idle() {
                debug!(%device, "Blocked: session is stopped");
                return ExecuteOutcome::Blocked;
            }
            let mut params = state.run_params();
            params.direction = Some(desired.direction);
            params.target = Some(desired.target);
            (desired, params)
        };

        self.notify(Some(device), NoticeKind::Sending);
        let outcome = self.inner.dispatcher.send(device, desired.mode, &params).await;
        self.record_send(device, desired, &outcome);
        ExecuteOutcome::Sent(outcome)
    }

    /// Gated raw send: refused (returns `false`) for non-idle modes while stopped.
    pub async fn execute_command(
        &self,
        device: DeviceId,
        mode: CommandMode,
        params: &CommandParams,
    ) -> bool {
        if self.status().is_stopped() && !mode.is_idle() {
            warn!(%device, %mode, "Refusing non-idle command while stopped");
            return false;
        }
        self.inner.dispatcher.send(device, mode, params).await.success
    }

    /// Per-unit stop button.
    pub async fn stop_unit(&self, device: DeviceId) -> DispatchOutcome {
        self.inner.debouncer.cancel(device);
        if let Ok(unit) = self.inner.state.lock().unit_mut(device) {
            unit.phase = UnitPhase::Stopping;
        }
        self.send_idle(device).await
    }

    // ---- manual workflow -------------------------------------------------

    /// Start a manual run: both units get their continuous-run command.
    ///
    /// The session is `Running` once this returns, even if a unit did not acknowledge.
    pub async fn start_manual(&self) -> Result<UnitOutcomes> {
        let (lcu, dcu) = {
            let mut state = self.inner.state.lock();
            if state.system_mode != SystemMode::Manual {
                return Err(HmiError::SessionState(
                    "start_manual requires manual mode".to_string(),
                ));
            }
            state.status = SessionStatus::Running;
            (state.lcu.clone(), state.dcu.clone())
        };
        info!("Manual run started");

        let (lcu, dcu) = tokio::join!(self.send_run(&lcu), self.send_run(&dcu));
        Ok(UnitOutcomes { lcu, dcu })
    }

    /// Stop a manual run: the session is stopped immediately, then both units get idle
    /// commands concurrently. A failed idle command leaves the session `DegradedStop`.
    pub async fn stop_manual(&self) -> UnitOutcomes {
        self.begin_stop();
        let outcomes = self.idle_both().await;
        self.finish_stop(&outcomes);
        outcomes
    }

    /// Emergency stop from any state: backend-wide stop and idle commands to both units,
    /// concurrently. Local selections reset to idle/zero and the active run is aborted.
    pub async fn emergency_stop(&self) -> EmergencyOutcome {
        self.inner.debouncer.cancel_all();
        let run = {
            let mut state = self.inner.state.lock();
            state.status = SessionStatus::Stopped;
            state.stop_epoch += 1;
            state.lcu = UnitControl::new(DeviceId::Lcu);
            state.dcu = UnitControl::new(DeviceId::Dcu);
            state.lcu.phase = UnitPhase::Stopping;
            state.dcu.phase = UnitPhase::Stopping;
            state.active_run.take()
        };
        warn!("Emergency stop");
        self.notify(None, NoticeKind::EmergencyStop);

        let (backend, units) =
            tokio::join!(self.inner.dispatcher.emergency_stop(), self.idle_both());
        let outcome = EmergencyOutcome { backend, units };
        if !outcome.all_succeeded() {
            let mut state = self.inner.state.lock();
            if state.status == SessionStatus::Stopped {
                state.status = SessionStatus::DegradedStop;
            }
            drop(state);
            warn!(
                backend = outcome.backend.success,
                lcu = outcome.units.lcu.success,
                dcu = outcome.units.dcu.success,
                "Emergency stop not fully acknowledged"
            );
            self.notify(None, NoticeKind::StopFailed);
        }

        if let Some(run) = run {
            self.abort_run(run.run_id, "Emergency stop").await;
        }
        outcome
    }

    // ---- experiment workflow ---------------------------------------------

    /// Create a run record, then command both units with the run's identifiers.
    ///
    /// If the run record cannot be created nothing is sent and the session is unchanged.
    pub async fn start_experiment(&self, start: ExperimentStart) -> Result<RunRecord> {
        let epoch = {
            let state = self.inner.state.lock();
            if state.system_mode != SystemMode::Experiment {
                return Err(HmiError::SessionState(
                    "start_experiment requires experiment mode".to_string(),
                ));
            }
            if let Some(run) = &state.active_run {
                return Err(HmiError::SessionState(format!(
                    "run {} is still active",
                    run.run_id
                )));
            }
            state.stop_epoch
        };
        for (device, control) in [(DeviceId::Lcu, start.lcu), (DeviceId::Dcu, start.dcu)] {
            if let Some(control) = control {
                control.direction.check(device)?;
            }
        }

        let new_run = NewRun {
            run_name: start.run_name.clone(),
            run_description: start.run_description.clone(),
            run_params: start.run_params.clone(),
            run_status: "running".to_string(),
            start_time: Some(Utc::now()),
        };
        let record = self
            .inner
            .backend
            .create_run(start.project_id, start.experiment_id, &new_run)
            .await?;
        info!(run_id = record.run_id, run = %record.run_name, "Experiment run created");

        let units = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.stop_epoch == epoch {
                let limits = self.inner.dispatcher.limits();
                for (unit, control) in [(&mut state.lcu, start.lcu), (&mut state.dcu, start.dcu)] {
                    if let Some(control) = control {
                        unit.direction = control.direction;
                        unit.target = limits.clamp(unit.device, unit.mode, control.setpoint);
                    }
                }
                state.active_run = Some(ActiveRun {
                    project_id: start.project_id,
                    experiment_id: start.experiment_id,
                    run_id: record.run_id,
                    run_name: record.run_name.clone(),
                });
                state.status = SessionStatus::Running;
                Some((state.lcu.clone(), state.dcu.clone()))
            } else {
                None
            }
        };
        let Some((lcu, dcu)) = units else {
            warn!(run_id = record.run_id, "Stopped while the run was being created");
            self.abort_run(record.run_id, "Stopped during start").await;
            return Err(HmiError::SessionState(format!(
                "run {} aborted: session stopped during start",
                record.run_id
            )));
        };

        let (lcu, dcu) = tokio::join!(self.send_run(&lcu), self.send_run(&dcu));
        if !(lcu.success && dcu.success) {
            warn!(run_id = record.run_id, "Experiment started with a unit not acknowledging");
        }
        Ok(record)
    }

    /// Idle both units, then close the active run as completed.
    pub async fn stop_experiment(&self) -> Result<UnitOutcomes> {
        let run = self.inner.state.lock().active_run.clone().ok_or_else(|| {
            HmiError::SessionState("no active experiment run".to_string())
        })?;

        self.begin_stop();
        let outcomes = self.idle_both().await;
        self.finish_stop(&outcomes);
        self.inner.state.lock().active_run = None;

        if let Err(e) = self
            .inner
            .backend
            .stop_run(run.run_id, &RunStop::completed())
            .await
        {
            warn!(run_id = run.run_id, error = %e, "Could not close run record");
            self.notify(None, NoticeKind::Failed);
        } else {
            info!(run_id = run.run_id, "Experiment run completed");
        }
        Ok(outcomes)
    }

    /// Cancel pending auto-sends and notice timers.
    pub fn shutdown(&self) {
        self.inner.debouncer.cancel_all();
        for timer in self.inner.notice_timers.lock().drain(..) {
            timer.abort();
        }
    }

    // ---- helpers ---------------------------------------------------------

    async fn send_run(&self, unit: &UnitControl) -> DispatchOutcome {
        let desired = LastSentCommand {
            mode: CommandMode::RunContinuous,
            direction: unit.direction,
            target: unit.target,
        };
        let mut params = {
            let state = self.inner.state.lock();
            if state.status.is_stopped() {
                debug!(device = %unit.device, "Blocked: session is stopped");
                return DispatchOutcome::failed("session is stopped");
            }
            state.run_params()
        };
        params.direction = Some(desired.direction);
        params.target = Some(desired.target);

        self.notify(Some(unit.device), NoticeKind::Sending);
        let outcome = self
            .inner
            .dispatcher
            .send(unit.device, desired.mode, &params)
            .await;
        self.record_send(unit.device, desired, &outcome);
        outcome
    }

    fn record_send(&self, device: DeviceId, sent: LastSentCommand, outcome: &DispatchOutcome) {
        if outcome.success {
            if let Ok(unit) = self.inner.state.lock().unit_mut(device) {
                unit.last_sent = Some(sent);
                unit.phase = if sent.mode.is_idle() {
                    UnitPhase::Idle
                } else {
                    UnitPhase::Commanded
                };
            }
            self.notify(Some(device), NoticeKind::Sent);
        } else {
            self.notify(Some(device), NoticeKind::Failed);
        }
    }

    fn begin_stop(&self) {
        self.inner.debouncer.cancel_all();
        let mut state = self.inner.state.lock();
        state.status = SessionStatus::Stopped;
        state.stop_epoch += 1;
        state.lcu.phase = UnitPhase::Stopping;
        state.dcu.phase = UnitPhase::Stopping;
        info!("Session stopped");
    }

    async fn abort_run(&self, run_id: i64, reason: &str) {
        if let Err(e) = self
            .inner
            .backend
            .stop_run(run_id, &RunStop::aborted(reason))
            .await
        {
            warn!(run_id, error = %e, "Could not abort run");
        }
    }

        async fn idle_both(&self) -> UnitOutcomes {
        let (lcu, dcu) = tokio::join!(self.send_idle(DeviceId::Lcu), self.send_idle(DeviceId::Dcu));
        UnitOutcomes { lcu, dcu }
    }

    async fn send_idle(&self, device: DeviceId) -> DispatchOutcome {
        let outcome = self.inner.dispatcher.idle(device).await;
        if outcome.success {
            if let Ok(unit) = self.inner.state.lock().unit_mut(device) {
                unit.phase = UnitPhase::Idle;
                // Force the next execute to resend the selection.
                unit.last_sent = None;
            }
            self.notify(Some(device), NoticeKind::Stopped);
        } else {
            warn!(%device, message = ?outcome.message, "Stop not acknowledged");
            self.notify(Some(device), NoticeKind::StopFailed);
        }
        outcome
    }

    fn finish_stop(&self, outcomes: &UnitOutcomes) {
        if outcomes.all_succeeded() {
            return;
        }
        let mut state = self.inner.state.lock();
        // A start issued meanwhile wins.
        if state.status == SessionStatus::Stopped {
            state.status = SessionStatus::DegradedStop;
            warn!("Stop degraded: a unit did not acknowledge its idle command");
        }
    }

    fn notify(&self, device: Option<DeviceId>, kind: NoticeKind) {
        let id = self.inner.next_notice.fetch_add(1, Ordering::Relaxed);
        self.inner.notices.send_modify(|board| {
            board.insert(device, ActionNotice { device, kind, id });
        });

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let ttl = self.inner.config.notice_ttl();
        let weak = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.notices.send_if_modified(|board| {
                    if board.get(&device).is_some_and(|n| n.id == id) {
                        board.remove(&device);
                        true
                    } else {
                        false
                    }
                });
            }
        });
        let mut timers = self.inner.notice_timers.lock();
        timers.retain(|t| !t.is_finished());
        timers.push(timer);
    }
}
