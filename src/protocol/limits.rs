//! Target ranges per device and mode.

use serde::{Deserialize, Serialize};

use super::{CommandMode, DeviceId};

/// Upper bounds for operator targets.
///
/// Ranges are inclusive and always start at 0:
///
/// - LCU run modes: `[0, lcu_duty_max]` (duty cycle, percent)
/// - LCU `PidSpeed`: `[0, lcu_speed_max]` (mm/s)
/// - DCU run modes: `[0, dcu_voltage_max]` (volts)
/// - other PID modes: `[0, +inf)`
/// - `Idle` and `Homing`: always 0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetLimits {
    /// Max LCU duty cycle
    pub lcu_duty_max: f64,
    /// Max LCU speed in closed-loop speed mode
    pub lcu_speed_max: f64,
    /// Max DCU drive voltage
    pub dcu_voltage_max: f64,
}

impl Default for TargetLimits {
    fn default() -> Self {
        Self {
            lcu_duty_max: 100.0,
            lcu_speed_max: 15.0,
            dcu_voltage_max: 24.0,
        }
    }
}

impl TargetLimits {
    /// Inclusive `(min, max)` range for a device/mode pair.
    #[must_use]
    pub fn range(&self, device: DeviceId, mode: CommandMode) -> (f64, f64) {
        match (device, mode) {
            (DeviceId::Sdu, _) | (_, CommandMode::Idle | CommandMode::Homing) => (0.0, 0.0),
            (DeviceId::Lcu, CommandMode::PidSpeed) => (0.0, self.lcu_speed_max),
            (DeviceId::Lcu, CommandMode::RunDuration | CommandMode::RunContinuous) => {
                (0.0, self.lcu_duty_max)
            }
            (DeviceId::Dcu, CommandMode::RunDuration | CommandMode::RunContinuous) => {
                (0.0, self.dcu_voltage_max)
            }
            _ => (0.0, f64::MAX),
        }
    }

    /// Clamp a requested target into range.
    ///
    /// NaN maps to the lower bound; infinities saturate.
    #[must_use]
    pub fn clamp(&self, device: DeviceId, mode: CommandMode, value: f64) -> f64 {
        let (lo, hi) = self.range(device, mode);
        if value.is_nan() {
            return lo;
        }
        value.clamp(lo, hi)
    }

    /// Check that every bound is finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("lcu_duty_max", self.lcu_duty_max),
            ("lcu_speed_max", self.lcu_speed_max),
            ("dcu_voltage_max", self.dcu_voltage_max),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("limits.{name} must be a finite value >= 0 (got {value})"));
            }
        }
        Ok(())
    }
}
