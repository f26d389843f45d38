//! Device identifiers, logical commands and the `send_command` wire payload.
//!
//! The rig exposes three units:
//!
//! - **LCU** - linear actuator (forward/backward, duty cycle or mm/s)
//! - **DCU** - drill/contactor (clockwise/counter-clockwise, volts)
//! - **SDU** - sensor unit (telemetry only, never commanded)
//!
//! Modes and directions are modelled as closed logical enums. Their numeric wire codes
//! drifted between firmware revisions, so they are never written as literals here:
//! [`ProtocolTable`] owns the encoding and every [`Command`] is encoded against one.

mod encoding;
mod limits;

pub use encoding::{
    DcuDirectionCodes, FirmwareRevision, LcuDirectionCodes, ModeCodes, ProtocolTable,
};
pub use limits::TargetLimits;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HmiError, Result};

/// One of the rig's control units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceId {
    /// Linear actuator control unit
    Lcu,
    /// Drill/contactor control unit
    Dcu,
    /// Sensor data unit (telemetry only)
    Sdu,
}

impl DeviceId {
    /// Every known device, in display order.
    pub const ALL: [DeviceId; 3] = [DeviceId::Lcu, DeviceId::Dcu, DeviceId::Sdu];

    /// Devices that accept commands.
    pub const COMMANDABLE: [DeviceId; 2] = [DeviceId::Lcu, DeviceId::Dcu];

    /// Wire name (`"lcu"`, `"dcu"`, `"sdu"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lcu => "lcu",
            Self::Dcu => "dcu",
            Self::Sdu => "sdu",
        }
    }

    /// Human-readable unit name.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Lcu => "Linear actuator",
            Self::Dcu => "Drill",
            Self::Sdu => "Sensor unit",
        }
    }

    /// Returns `true` if the device accepts commands.
    #[must_use]
    pub fn is_commandable(self) -> bool {
        !matches!(self, Self::Sdu)
    }

    /// Directions accepted by this device (including `Idle`).
    #[must_use]
    pub fn directions(self) -> &'static [Direction] {
        match self {
            Self::Lcu => &[Direction::Idle, Direction::Forward, Direction::Backward],
            Self::Dcu => &[
                Direction::Idle,
                Direction::Clockwise,
                Direction::CounterClockwise,
            ],
            Self::Sdu => &[Direction::Idle],
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lcu" => Ok(Self::Lcu),
            "dcu" => Ok(Self::Dcu),
            "sdu" => Ok(Self::Sdu),
            other => Err(format!("unknown device '{other}' (expected lcu, dcu or sdu)")),
        }
    }
}

/// Logical command mode. Numeric codes come from a [`ProtocolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// No commanded motion
    Idle,
    /// Run for a fixed duration
    RunDuration,
    /// Hold direction and target until superseded
    RunContinuous,
    /// Closed-loop position
    PidPosition,
    /// Closed-loop current
    PidCurrent,
    /// Closed-loop load (LCU) or torque (DCU)
    PidLoad,
    /// Closed-loop speed
    PidSpeed,
    /// Homing sequence
    Homing,
}

impl CommandMode {
    /// Every mode, in code order of the default table.
    pub const ALL: [CommandMode; 8] = [
        CommandMode::Idle,
        CommandMode::RunDuration,
        CommandMode::RunContinuous,
        CommandMode::PidPosition,
        CommandMode::PidCurrent,
        CommandMode::PidLoad,
        CommandMode::PidSpeed,
        CommandMode::Homing,
    ];

    /// Returns `true` for the idle mode.
    #[must_use]
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` for closed-loop modes, where the target is a setpoint.
    #[must_use]
    pub fn is_pid(self) -> bool {
        matches!(
            self,
            Self::PidPosition | Self::PidCurrent | Self::PidLoad | Self::PidSpeed
        )
    }

    /// Short name used by the HMI (`run_cont`, `pid_speed`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RunDuration => "run_dur",
            Self::RunContinuous => "run_cont",
            Self::PidPosition => "pid_pos",
            Self::PidCurrent => "pid_current",
            Self::PidLoad => "pid_load",
            Self::PidSpeed => "pid_speed",
            Self::Homing => "homing",
        }
    }
}

impl fmt::Display for CommandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "idle" => Ok(Self::Idle),
            "run_dur" | "run_duration" => Ok(Self::RunDuration),
            "run_cont" | "run_continuous" => Ok(Self::RunContinuous),
            "pid_pos" | "pid_position" => Ok(Self::PidPosition),
            "pid_current" => Ok(Self::PidCurrent),
            "pid_load" | "pid_torque" => Ok(Self::PidLoad),
            "pid_speed" => Ok(Self::PidSpeed),
            "homing" => Ok(Self::Homing),
            other => Err(format!("unknown command mode '{other}'")),
        }
    }
}

/// Logical motion direction. Each device accepts `Idle` plus its own pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// No direction
    Idle,
    /// LCU forward
    Forward,
    /// LCU backward
    Backward,
    /// DCU clockwise
    Clockwise,
    /// DCU counter-clockwise
    CounterClockwise,
}

impl Direction {
    /// Returns `true` if `device` accepts this direction.
    #[must_use]
    pub fn valid_for(self, device: DeviceId) -> bool {
        device.directions().contains(&self)
    }

    /// Validates this direction for `device`.
    pub fn check(self, device: DeviceId) -> Result<Self> {
        if self.valid_for(device) {
            Ok(self)
        } else {
            Err(HmiError::InvalidDirection {
                device,
                direction: self,
            })
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "idle" => Ok(Self::Idle),
            "fw" | "forward" => Ok(Self::Forward),
            "bw" | "backward" => Ok(Self::Backward),
            "cw" | "clockwise" => Ok(Self::Clockwise),
            "ccw" | "counter_clockwise" => Ok(Self::CounterClockwise),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Optional parameters accompanying a command.
///
/// Missing identifiers are transmitted as 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommandParams {
    /// Requested direction (defaults to `Idle`)
    pub direction: Option<Direction>,
    /// Open-loop target (duty cycle, volts, mm/s)
    pub target: Option<f64>,
    /// Closed-loop setpoint; falls back to `target` in PID modes
    pub pid_setpoint: Option<f64>,
    /// Duration for `RunDuration`
    pub duration_secs: Option<f64>,
    /// Active project
    pub project_id: Option<i64>,
    /// Active experiment
    pub experiment_id: Option<i64>,
    /// Active run
    pub run_id: Option<i64>,
}

impl CommandParams {
    /// Parameters carrying a direction and a target.
    #[must_use]
    pub fn motion(direction: Direction, target: f64) -> Self {
        Self {
            direction: Some(direction),
            target: Some(target),
            ..Self::default()
        }
    }

    /// Attach the experiment run identifiers.
    #[must_use]
    pub fn with_run(mut self, project_id: i64, experiment_id: i64, run_id: i64) -> Self {
        self.project_id = Some(project_id);
        self.experiment_id = Some(experiment_id);
        self.run_id = Some(run_id);
        self
    }

    /// Attach a duration (seconds).
    #[must_use]
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_secs = Some(seconds);
        self
    }
}

/// A logical command for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Addressed device
    pub device: DeviceId,
    /// Logical mode
    pub mode: CommandMode,
    /// Logical direction
    pub direction: Direction,
    /// Requested target before clamping
    pub target: f64,
    /// Closed-loop setpoint
    pub pid_setpoint: Option<f64>,
    /// Duration for `RunDuration`
    pub duration_secs: Option<f64>,
    /// Active project
    pub project_id: Option<i64>,
    /// Active experiment
    pub experiment_id: Option<i64>,
    /// Active run
    pub run_id: Option<i64>,
}

impl Command {
    /// Build a command from a parameter bag.
    #[must_use]
    pub fn new(device: DeviceId, mode: CommandMode, params: &CommandParams) -> Self {
        Self {
            device,
            mode,
            direction: params.direction.unwrap_or(Direction::Idle),
            target: params.target.unwrap_or(0.0),
            pid_setpoint: params.pid_setpoint,
            duration_secs: params.duration_secs,
            project_id: params.project_id,
            experiment_id: params.experiment_id,
            run_id: params.run_id,
        }
    }

    /// Idle command for `device`.
    #[must_use]
    pub fn idle(device: DeviceId) -> Self {
        Self::new(device, CommandMode::Idle, &CommandParams::default())
    }

    /// Encode against a protocol table, clamping the target to the device/mode range.
    pub fn encode(&self, table: &ProtocolTable, limits: &TargetLimits) -> Result<CommandRequest> {
        if !self.device.is_commandable() {
            return Err(HmiError::NotCommandable(self.device));
        }
        let direction = table.direction_code(self.device, self.direction)?;

        let (target, pid_setpoint) = if self.mode.is_pid() {
            let setpoint = self.pid_setpoint.unwrap_or(self.target);
            (0.0, limits.clamp(self.device, self.mode, setpoint))
        } else {
            // The setpoint field only carries meaning in PID modes.
            (limits.clamp(self.device, self.mode, self.target), 0.0)
        };

        Ok(CommandRequest {
            device: self.device,
            command: WireCommand {
                mode: table.mode_code(self.mode),
                direction,
                target,
                pid_setpoint,
                duration: self.duration_secs.unwrap_or(0.0),
                project_id: self.project_id.unwrap_or(0),
                experiment_id: self.experiment_id.unwrap_or(0),
                run_id: self.run_id.unwrap_or(0),
            },
        })
    }
}

/// Body of `POST /send_command/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Addressed device
    pub device: DeviceId,
    /// Encoded command
    pub command: WireCommand,
}

/// Encoded command fields, as the backend forwards them to the unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WireCommand {
    /// Mode code
    pub mode: u8,
    /// Direction code
    pub direction: u8,
    /// Clamped open-loop target
    pub target: f64,
    /// Clamped closed-loop setpoint
    pub pid_setpoint: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Active project (0 if none)
    pub project_id: i64,
    /// Active experiment (0 if none)
    pub experiment_id: i64,
    /// Active run (0 if none)
    pub run_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_round_trips_through_str() {
        for device in DeviceId::ALL {
            assert_eq!(device.as_str().parse::<DeviceId>().unwrap(), device);
        }
        assert!("mcu".parse::<DeviceId>().is_err());
    }

    #[test]
    fn sdu_is_not_commandable() {
        assert!(!DeviceId::Sdu.is_commandable());
        let err = Command::idle(DeviceId::Sdu)
            .encode(&ProtocolTable::default(), &TargetLimits::default())
            .unwrap_err();
        assert!(matches!(err, HmiError::NotCommandable(DeviceId::Sdu)));
    }

    #[test]
    fn directions_are_device_specific() {
        assert!(Direction::Forward.valid_for(DeviceId::Lcu));
        assert!(!Direction::Forward.valid_for(DeviceId::Dcu));
        assert!(Direction::CounterClockwise.valid_for(DeviceId::Dcu));
        assert!(Direction::Idle.valid_for(DeviceId::Dcu));
        assert!(Direction::Clockwise.check(DeviceId::Lcu).is_err());
    }

    #[test]
    fn mode_aliases_parse() {
        assert_eq!("run_cont".parse::<CommandMode>().unwrap(), CommandMode::RunContinuous);
        assert_eq!("pid_torque".parse::<CommandMode>().unwrap(), CommandMode::PidLoad);
        assert_eq!("run-dur".parse::<CommandMode>().unwrap(), CommandMode::RunDuration);
    }

    #[test]
    fn run_continuous_encodes_clamped_target() {
        let table = ProtocolTable::default();
        let cmd = Command::new(
            DeviceId::Dcu,
            CommandMode::RunContinuous,
            &CommandParams::motion(Direction::CounterClockwise, 30.0),
        );
        let request = cmd.encode(&table, &TargetLimits::default()).unwrap();
        assert_eq!(request.device, DeviceId::Dcu);
        assert_eq!(request.command.mode, 2);
        assert_eq!(request.command.direction, 2);
        assert_eq!(request.command.target, 24.0);
        assert_eq!(request.command.pid_setpoint, 0.0);
        assert_eq!(request.command.run_id, 0);
    }

    #[test]
    fn pid_modes_move_target_into_setpoint() {
        let cmd = Command::new(
            DeviceId::Lcu,
            CommandMode::PidSpeed,
            &CommandParams::motion(Direction::Forward, 40.0),
        );
        let request = cmd
            .encode(&ProtocolTable::default(), &TargetLimits::default())
            .unwrap();
        assert_eq!(request.command.target, 0.0);
        assert_eq!(request.command.pid_setpoint, 15.0);
    }

    #[test]
    fn setpoint_is_zeroed_outside_pid_modes() {
        let params = CommandParams {
            pid_setpoint: Some(9_999.0),
            ..CommandParams::motion(Direction::Forward, 5.0)
        };
        let cmd = Command::new(DeviceId::Lcu, CommandMode::RunContinuous, &params);
        let request = cmd
            .encode(&ProtocolTable::default(), &TargetLimits::default())
            .unwrap();
        assert_eq!(request.command.target, 5.0);
        assert_eq!(request.command.pid_setpoint, 0.0);
    }

    #[test]
    fn wire_payload_uses_backend_field_names() {
        let cmd = Command::new(
            DeviceId::Lcu,
            CommandMode::RunContinuous,
            &CommandParams::motion(Direction::Forward, 5.0).with_run(3, 7, 11),
        );
        let request = cmd
            .encode(&ProtocolTable::default(), &TargetLimits::default())
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["device"], "lcu");
        assert_eq!(json["command"]["mode"], 2);
        assert_eq!(json["command"]["target"], 5.0);
        assert_eq!(json["command"]["project_id"], 3);
        assert_eq!(json["command"]["experiment_id"], 7);
        assert_eq!(json["command"]["run_id"], 11);
        assert_eq!(json["command"]["duration"], 0.0);
    }
}
