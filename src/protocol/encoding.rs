//! Versioned numeric encodings for modes and directions.
//!
//! Two encodings have been deployed on the rig. They agree on the run and PID mode codes
//! but disagree on the homing code and on which LCU direction is `1`:
//!
//! | | homing | LCU forward | LCU backward | DCU cw | DCU ccw |
//! |---|---|---|---|---|---|
//! | `Firmware` | 8 | 2 | 1 | 1 | 2 |
//! | `HmiLegacy` | 7 | 1 | 2 | 1 | 2 |
//!
//! `Firmware` matches what the unit firmware decodes and is the default.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{CommandMode, DeviceId, Direction};
use crate::error::{HmiError, Result};

/// Which deployed encoding a [`ProtocolTable`] follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirmwareRevision {
    /// Encoding decoded by the current LCU/DCU firmware
    #[default]
    Firmware,
    /// Encoding used by the first HMI constants
    HmiLegacy,
}

/// Mode code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeCodes {
    pub idle: u8,
    pub run_duration: u8,
    pub run_continuous: u8,
    pub pid_position: u8,
    pub pid_current: u8,
    pub pid_load: u8,
    pub pid_speed: u8,
    pub homing: u8,
}

/// LCU direction code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcuDirectionCodes {
    pub idle: u8,
    pub forward: u8,
    pub backward: u8,
}

/// DCU direction code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcuDirectionCodes {
    pub idle: u8,
    pub clockwise: u8,
    pub counter_clockwise: u8,
}

/// Complete encoding for one firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTable {
    /// Revision this table was derived from
    pub revision: FirmwareRevision,
    /// Mode codes
    pub modes: ModeCodes,
    /// LCU direction codes
    pub lcu_directions: LcuDirectionCodes,
    /// DCU direction codes
    pub dcu_directions: DcuDirectionCodes,
}

impl ProtocolTable {
    /// Preset table for a revision.
    #[must_use]
    pub fn for_revision(revision: FirmwareRevision) -> Self {
        let base_modes = ModeCodes {
            idle: 0,
            run_duration: 1,
            run_continuous: 2,
            pid_position: 3,
            pid_current: 4,
            pid_load: 5,
            pid_speed: 6,
            homing: 8,
        };
        let dcu_directions = DcuDirectionCodes {
            idle: 0,
            clockwise: 1,
            counter_clockwise: 2,
        };
        match revision {
            FirmwareRevision::Firmware => Self {
                revision,
                modes: base_modes,
                lcu_directions: LcuDirectionCodes {
                    idle: 0,
                    forward: 2,
                    backward: 1,
                },
                dcu_directions,
            },
            FirmwareRevision::HmiLegacy => Self {
                revision,
                modes: ModeCodes {
                    homing: 7,
                    ..base_modes
                },
                lcu_directions: LcuDirectionCodes {
                    idle: 0,
                    forward: 1,
                    backward: 2,
                },
                dcu_directions,
            },
        }
    }

    /// Numeric code for a mode.
    #[must_use]
    pub fn mode_code(&self, mode: CommandMode) -> u8 {
        let m = &self.modes;
        match mode {
            CommandMode::Idle => m.idle,
            CommandMode::RunDuration => m.run_duration,
            CommandMode::RunContinuous => m.run_continuous,
            CommandMode::PidPosition => m.pid_position,
            CommandMode::PidCurrent => m.pid_current,
            CommandMode::PidLoad => m.pid_load,
            CommandMode::PidSpeed => m.pid_speed,
            CommandMode::Homing => m.homing,
        }
    }

    /// Logical mode for a numeric code, if the table defines one.
    #[must_use]
    pub fn mode_from_code(&self, code: u8) -> Option<CommandMode> {
        CommandMode::ALL
            .into_iter()
            .find(|mode| self.mode_code(*mode) == code)
    }

    /// Numeric code for a direction on a device.
    pub fn direction_code(&self, device: DeviceId, direction: Direction) -> Result<u8> {
        let invalid = || HmiError::InvalidDirection { device, direction };
        match device {
            DeviceId::Lcu => {
                let d = &self.lcu_directions;
                match direction {
                    Direction::Idle => Ok(d.idle),
                    Direction::Forward => Ok(d.forward),
                    Direction::Backward => Ok(d.backward),
                    _ => Err(invalid()),
                }
            }
            DeviceId::Dcu => {
                let d = &self.dcu_directions;
                match direction {
                    Direction::Idle => Ok(d.idle),
                    Direction::Clockwise => Ok(d.clockwise),
                    Direction::CounterClockwise => Ok(d.counter_clockwise),
                    _ => Err(invalid()),
                }
            }
            DeviceId::Sdu => Err(HmiError::NotCommandable(device)),
        }
    }

    /// Logical direction for a numeric code on a device.
    #[must_use]
    pub fn direction_from_code(&self, device: DeviceId, code: u8) -> Option<Direction> {
        device
            .directions()
            .iter()
            .copied()
            .find(|direction| self.direction_code(device, *direction).ok() == Some(code))
    }

    /// Check that no two modes, and no two directions of one device, share a code.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for mode in CommandMode::ALL {
            if !seen.insert(self.mode_code(mode)) {
                return Err(format!(
                    "mode code {} is assigned twice (at {mode})",
                    self.mode_code(mode)
                ));
            }
        }
        for device in DeviceId::COMMANDABLE {
            let mut seen = HashSet::new();
            for direction in device.directions() {
                let code = self.direction_code(device, *direction).map_err(|e| e.to_string())?;
                if !seen.insert(code) {
                    return Err(format!(
                        "{device} direction code {code} is assigned twice (at {direction:?})"
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::for_revision(FirmwareRevision::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_disagree_on_homing_and_lcu_direction() {
        let firmware = ProtocolTable::for_revision(FirmwareRevision::Firmware);
        let legacy = ProtocolTable::for_revision(FirmwareRevision::HmiLegacy);

        assert_eq!(firmware.mode_code(CommandMode::Homing), 8);
        assert_eq!(legacy.mode_code(CommandMode::Homing), 7);
        assert_eq!(
            firmware.direction_code(DeviceId::Lcu, Direction::Forward).unwrap(),
            2
        );
        assert_eq!(
            legacy.direction_code(DeviceId::Lcu, Direction::Forward).unwrap(),
            1
        );
        assert_eq!(
            firmware.mode_code(CommandMode::RunContinuous),
            legacy.mode_code(CommandMode::RunContinuous)
        );
    }

    #[test]
    fn codes_decode_back_to_logical_values() {
        for revision in [FirmwareRevision::Firmware, FirmwareRevision::HmiLegacy] {
            let table = ProtocolTable::for_revision(revision);
            for mode in CommandMode::ALL {
                assert_eq!(table.mode_from_code(table.mode_code(mode)), Some(mode));
            }
            for device in DeviceId::COMMANDABLE {
                for direction in device.directions() {
                    let code = table.direction_code(device, *direction).unwrap();
                    assert_eq!(table.direction_from_code(device, code), Some(*direction));
                }
            }
        }
    }

    #[test]
    fn presets_validate() {
        assert!(ProtocolTable::for_revision(FirmwareRevision::Firmware)
            .validate()
            .is_ok());
        assert!(ProtocolTable::for_revision(FirmwareRevision::HmiLegacy)
            .validate()
            .is_ok());
    }

    #[test]
    fn colliding_codes_are_rejected() {
        let mut table = ProtocolTable::default();
        table.modes.homing = table.modes.pid_speed;
        assert!(table.validate().is_err());

        let mut table = ProtocolTable::default();
        table.dcu_directions.counter_clockwise = table.dcu_directions.clockwise;
        assert!(table.validate().unwrap_err().contains("dcu"));
    }

    #[test]
    fn wrong_device_direction_is_an_error() {
        let table = ProtocolTable::default();
        assert!(table
            .direction_code(DeviceId::Lcu, Direction::Clockwise)
            .is_err());
        assert!(table.direction_code(DeviceId::Sdu, Direction::Idle).is_err());
    }

    #[test]
    fn revision_names_are_kebab_case() {
        let rev: FirmwareRevision = serde_json::from_str("\"hmi-legacy\"").unwrap();
        assert_eq!(rev, FirmwareRevision::HmiLegacy);
    }
}
