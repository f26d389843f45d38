//! Device Status Aggregator
//!
//! Keeps one [`DeviceStatus`] record per known device and derives an
//! [`OverallSummary`] from them. Records start `offline` with no last-seen time and are
//! updated in place from transport events:
//!
//! - a status snapshot replaces the records of every device it names
//! - a telemetry sample marks its device online and bumps its sample count
//! - [`DeviceStatusAggregator::apply_staleness`] downgrades silent devices, the way the
//!   backend's own monitor does
//!
//! Re-delivering the same snapshot or sample is a no-op; both carry a timestamp and
//! anything not newer than what was already applied is ignored.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::HealthThresholds;
use crate::protocol::DeviceId;
use crate::transport::{
    DeviceSample, EventKind, InboundEvent, StatusSnapshot, TransportManager,
};

/// Normalized device health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Reporting normally
    Online,
    /// Reporting late or with errors
    Warning,
    /// Not reporting
    #[default]
    Offline,
}

impl HealthState {
    /// Map a wire status string, including the legacy vocabulary
    /// (`connected` → online, `error` → warning, anything else → offline).
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" | "connected" => Self::Online,
            "warning" | "error" => Self::Warning,
            _ => Self::Offline,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Warning => "warning",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current record for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Device
    pub device: DeviceId,
    /// Health
    pub status: HealthState,
    /// Last time the device was heard from
    pub last_seen: Option<DateTime<Utc>>,
    /// Samples received
    pub sample_count: u64,
    /// Heartbeat interval, when the backend reports one
    pub heartbeat_interval_secs: Option<f64>,
    /// Error text from the legacy status shape
    pub error: Option<String>,
}

impl DeviceStatus {
    fn initial(device: DeviceId) -> Self {
        Self {
            device,
            status: HealthState::Offline,
            last_seen: None,
            sample_count: 0,
            heartbeat_interval_secs: None,
            error: None,
        }
    }
}

/// Coarse label over all devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverallSummary {
    /// Every device online
    AllOnline,
    /// No device online and none in warning
    AllOffline,
    /// At least one device in warning
    Warnings(usize),
    /// Some devices online, none in warning
    Partial {
        /// Devices online
        online: usize,
        /// Devices tracked
        total: usize,
    },
}

impl OverallSummary {
    /// Operator-facing label.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::AllOnline => "All online".to_string(),
            Self::AllOffline => "All offline".to_string(),
            Self::Warnings(1) => "1 warning".to_string(),
            Self::Warnings(n) => format!("{n} warnings"),
            Self::Partial { online, total } => format!("{online}/{total} online"),
        }
    }
}

impl fmt::Display for OverallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Parse a backend timestamp: RFC 3339, or naive ISO-8601 taken as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Human-readable age of `last_seen` relative to `now`.
#[must_use]
pub fn format_last_seen(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(seen) = last_seen else {
        return "Never".to_string();
    };
    let secs = (now - seen).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

/// Per-device status records.
#[derive(Debug, Clone)]
pub struct DeviceStatusAggregator {
    records: HashMap<DeviceId, DeviceStatus>,
    last_snapshot: Option<DateTime<Utc>>,
}

impl Default for DeviceStatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStatusAggregator {
    /// Every known device, offline and never seen.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DeviceId::ALL
                .iter()
                .map(|&device| (device, DeviceStatus::initial(device)))
                .collect(),
            last_snapshot: None,
        }
    }

    /// Record for `device`.
    #[must_use]
    pub fn get(&self, device: DeviceId) -> Option<&DeviceStatus> {
        self.records.get(&device)
    }

    /// All records, in `DeviceId::ALL` order.
    #[must_use]
    pub fn records(&self) -> Vec<DeviceStatus> {
        DeviceId::ALL
            .iter()
            .filter_map(|device| self.records.get(device).cloned())
            .collect()
    }

    /// Replace the records of every device in `snapshot`.
    ///
    /// Returns `false` when the snapshot is not newer than the last one applied.
    pub fn apply_status_event(&mut self, snapshot: &StatusSnapshot) -> bool {
        let stamp = snapshot.timestamp.as_deref().and_then(parse_timestamp);
        if let (Some(stamp), Some(last)) = (stamp, self.last_snapshot) {
            if stamp <= last {
                trace!(%stamp, "Ignoring stale status snapshot");
                return false;
            }
        }

        for report in &snapshot.devices {
            let record = DeviceStatus {
                device: report.device,
                status: report.status,
                last_seen: report.last_seen.as_deref().and_then(parse_timestamp),
                sample_count: report.data_count,
                heartbeat_interval_secs: report.heartbeat_interval_secs,
                error: report.error.clone(),
            };
            self.records.insert(report.device, record);
        }
        if stamp.is_some() {
            self.last_snapshot = stamp;
        }
        debug!(devices = snapshot.devices.len(), "Applied status snapshot");
        true
    }

    /// Count one telemetry sample for its device.
    ///
    /// Samples without a timestamp are stamped with the current time. Returns `false`
    /// when the sample is not newer than the record's last-seen time.
    pub fn apply_device_sample(&mut self, sample: &DeviceSample) -> bool {
        let stamp = sample
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let record = self
            .records
            .entry(sample.device)
            .or_insert_with(|| DeviceStatus::initial(sample.device));
        if record.last_seen.is_some_and(|seen| stamp <= seen) {
            return false;
        }
        record.last_seen = Some(stamp);
        record.sample_count += 1;
        record.status = HealthState::Online;
        record.error = None;
        true
    }

    /// Apply a unit-specific status payload (`lcu_status` / `dcu_status`).
    pub fn apply_unit_status(&mut self, device: DeviceId, payload: &serde_json::Value) -> bool {
        let Some(status) = payload.get("status").and_then(serde_json::Value::as_str) else {
            return false;
        };
        let record = self
            .records
            .entry(device)
            .or_insert_with(|| DeviceStatus::initial(device));
        record.status = HealthState::from_wire(status);
        if let Some(seen) = payload
            .get("last_seen")
            .and_then(serde_json::Value::as_str)
            .and_then(parse_timestamp)
        {
            record.last_seen = Some(seen);
        }
        true
    }

    /// Route any transport event to the matching update. Returns whether a record changed.
    pub fn apply_event(&mut self, event: &InboundEvent) -> bool {
        match event {
            InboundEvent::DeviceStatusUpdate(snapshot) => self.apply_status_event(snapshot),
            InboundEvent::DeviceData(sample) => self.apply_device_sample(sample),
            InboundEvent::DeviceStatus { device, payload } => {
                self.apply_unit_status(*device, payload)
            }
            InboundEvent::Generic { .. } => false,
        }
    }

    /// Downgrade devices silent for longer than the thresholds. Returns how many changed.
    pub fn apply_staleness(&mut self, now: DateTime<Utc>, thresholds: &HealthThresholds) -> usize {
        let warning_after = i64::try_from(thresholds.warning_after_secs).unwrap_or(i64::MAX);
        let offline_after = i64::try_from(thresholds.offline_after_secs).unwrap_or(i64::MAX);
        let mut changed = 0;
        for record in self.records.values_mut() {
            let Some(seen) = record.last_seen else {
                continue;
            };
            let silent = (now - seen).num_seconds();
            let next = if silent > offline_after {
                HealthState::Offline
            } else if silent > warning_after {
                HealthState::Warning
            } else {
                continue;
            };
            if record.status != next {
                debug!(device = %record.device, from = %record.status, to = %next, silent, "Device went quiet");
                record.status = next;
                changed += 1;
            }
        }
        changed
    }

    /// Last-seen text for `device`: `Never`, `Ns ago`, `Nm ago` or `Nh ago`.
    #[must_use]
    pub fn last_seen_text(&self, device: DeviceId, now: DateTime<Utc>) -> String {
        format_last_seen(self.records.get(&device).and_then(|r| r.last_seen), now)
    }

    /// Summary derived from the current records only.
    #[must_use]
    pub fn overall_summary(&self) -> OverallSummary {
        let total = self.records.len();
        let online = self
            .records
            .values()
            .filter(|r| r.status == HealthState::Online)
            .count();
        let warnings = self
            .records
            .values()
            .filter(|r| r.status == HealthState::Warning)
            .count();

        if total > 0 && online == total {
            OverallSummary::AllOnline
        } else if warnings > 0 {
            OverallSummary::Warnings(warnings)
        } else if online == 0 {
            OverallSummary::AllOffline
        } else {
            OverallSummary::Partial { online, total }
        }
    }

    /// Feed a shared aggregator from `transport`'s status and data events.
    pub fn attach(transport: &TransportManager) -> Arc<RwLock<Self>> {
        let shared = Arc::new(RwLock::new(Self::new()));
        for kind in [
            EventKind::DeviceStatusUpdate,
            EventKind::LcuStatus,
            EventKind::DcuStatus,
            EventKind::LcuData,
            EventKind::DcuData,
            EventKind::SduData,
        ] {
            let aggregator = Arc::clone(&shared);
            transport.on(kind, move |event| {
                aggregator.write().apply_event(event);
            });
        }
        shared
    }
}
