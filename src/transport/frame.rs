//! Inbound frame decoding.
//!
//! The backend has emitted two generations of frames:
//!
//! ```text
//! {"type": "device_status_update", "data": {"devices": [{"device": "lcu", "status": "online", ...}], "timestamp": ...}}
//! {"devices": {"lcu": {"status": "connected", "last_seen": ..., "error": null}}, "timestamp": ...}
//! ```
//!
//! [`decode_inbound_frame`] detects the shape once and returns a tagged [`InboundEvent`];
//! subscribers never sniff payload shapes themselves. The same parsers turn poll
//! responses into events, so both strategies publish identical values.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::protocol::DeviceId;
use crate::status::HealthState;

/// Closed set of event kinds subscribers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Connectivity snapshot for every device
    DeviceStatusUpdate,
    /// Unit-specific LCU status
    LcuStatus,
    /// Unit-specific DCU status
    DcuStatus,
    /// LCU telemetry
    LcuData,
    /// DCU telemetry
    DcuData,
    /// SDU telemetry
    SduData,
    /// Anything else, including envelope-less frames
    Generic,
}

impl EventKind {
    /// Every kind, for subscribing to all of them.
    pub const ALL: [EventKind; 7] = [
        EventKind::DeviceStatusUpdate,
        EventKind::LcuStatus,
        EventKind::DcuStatus,
        EventKind::LcuData,
        EventKind::DcuData,
        EventKind::SduData,
        EventKind::Generic,
    ];

    /// Wire name of the envelope `type`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceStatusUpdate => "device_status_update",
            Self::LcuStatus => "lcu_status",
            Self::DcuStatus => "dcu_status",
            Self::LcuData => "lcu_data",
            Self::DcuData => "dcu_data",
            Self::SduData => "sdu_data",
            Self::Generic => "data",
        }
    }

    /// Telemetry kind for a device.
    #[must_use]
    pub fn data_for(device: DeviceId) -> Self {
        match device {
            DeviceId::Lcu => Self::LcuData,
            DeviceId::Dcu => Self::DcuData,
            DeviceId::Sdu => Self::SduData,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device's entry in a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatusReport {
    /// Device
    pub device: DeviceId,
    /// Normalized health
    pub status: HealthState,
    /// Last time the backend heard from the unit, as sent
    pub last_seen: Option<String>,
    /// Samples received by the backend
    pub data_count: u64,
    /// Reported heartbeat interval
    pub heartbeat_interval_secs: Option<f64>,
    /// Error text (legacy shape only)
    pub error: Option<String>,
}

/// Connectivity snapshot for all devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Per-device reports, in the order the backend sent them
    pub devices: Vec<DeviceStatusReport>,
    /// Snapshot timestamp, as sent
    pub timestamp: Option<String>,
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSample {
    /// Device
    pub device: DeviceId,
    /// Device-specific payload
    pub data: Value,
    /// Sample timestamp, as sent
    pub timestamp: Option<String>,
}

/// A decoded, normalized inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InboundEvent {
    /// Connectivity snapshot (new or legacy shape)
    DeviceStatusUpdate(StatusSnapshot),
    /// Unit-specific status payload
    DeviceStatus {
        /// Device the status belongs to
        device: DeviceId,
        /// Raw status payload
        payload: Value,
    },
    /// Telemetry sample
    DeviceData(DeviceSample),
    /// Unrecognized type or envelope-less object
    Generic {
        /// Envelope `type`, or `"data"` for envelope-less frames
        kind: String,
        /// Raw payload
        payload: Value,
    },
}

impl InboundEvent {
    /// Kind used to route this event to subscribers.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceStatusUpdate(_) => EventKind::DeviceStatusUpdate,
            Self::DeviceStatus {
                device: DeviceId::Lcu,
                ..
            } => EventKind::LcuStatus,
            Self::DeviceStatus {
                device: DeviceId::Dcu,
                ..
            } => EventKind::DcuStatus,
            Self::DeviceStatus { .. } | Self::Generic { .. } => EventKind::Generic,
            Self::DeviceData(sample) => EventKind::data_for(sample.device),
        }
    }
}

/// Reasons a frame is dropped.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Not valid JSON
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON but not an object
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Known envelope type with a payload of the wrong shape
    #[error("malformed '{kind}' payload: {reason}")]
    Payload {
        /// Envelope type
        kind: String,
        /// What was wrong
        reason: String,
    },
}

/// Decode one text frame from the push transport.
pub fn decode_inbound_frame(raw: &str) -> Result<InboundEvent, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(object) = value else {
        return Err(FrameError::NotAnObject);
    };

    if let (Some(kind), Some(data)) = (object.get("type").and_then(Value::as_str), object.get("data")) {
        if !data.is_null() {
            return decode_envelope(kind, data);
        }
    }

    if is_legacy_snapshot(&object) {
        let snapshot = parse_status_snapshot(&Value::Object(object))
            .map_err(|reason| payload_error("device_status", reason))?;
        return Ok(InboundEvent::DeviceStatusUpdate(snapshot));
    }

    Ok(InboundEvent::Generic {
        kind: EventKind::Generic.as_str().to_string(),
        payload: Value::Object(object),
    })
}

fn decode_envelope(kind: &str, data: &Value) -> Result<InboundEvent, FrameError> {
    match kind {
        "device_status_update" | "device_status" => parse_status_snapshot(data)
            .map(InboundEvent::DeviceStatusUpdate)
            .map_err(|reason| payload_error(kind, reason)),
        "lcu_status" => Ok(InboundEvent::DeviceStatus {
            device: DeviceId::Lcu,
            payload: data.clone(),
        }),
        "dcu_status" => Ok(InboundEvent::DeviceStatus {
            device: DeviceId::Dcu,
            payload: data.clone(),
        }),
        "lcu_data" => Ok(InboundEvent::DeviceData(sample_from_envelope(DeviceId::Lcu, data))),
        "dcu_data" => Ok(InboundEvent::DeviceData(sample_from_envelope(DeviceId::Dcu, data))),
        "sdu_data" => Ok(InboundEvent::DeviceData(sample_from_envelope(DeviceId::Sdu, data))),
        other => Ok(InboundEvent::Generic {
            kind: other.to_string(),
            payload: data.clone(),
        }),
    }
}

fn payload_error(kind: &str, reason: String) -> FrameError {
    FrameError::Payload {
        kind: kind.to_string(),
        reason,
    }
}

fn sample_from_envelope(device: DeviceId, data: &Value) -> DeviceSample {
    DeviceSample {
        device,
        timestamp: data
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_owned),
        data: data.clone(),
    }
}

/// `{devices: {lcu: {status: ...}, ...}}` without an envelope.
fn is_legacy_snapshot(object: &Map<String, Value>) -> bool {
    match object.get("devices") {
        Some(Value::Object(devices)) => {
            !devices.is_empty()
                && devices
                    .iter()
                    .all(|(name, entry)| name.parse::<DeviceId>().is_ok() && entry.get("status").is_some())
        }
        _ => false,
    }
}

/// Parse a status snapshot in either the list shape or the legacy map shape.
///
/// Entries naming unknown devices are skipped.
pub fn parse_status_snapshot(data: &Value) -> Result<StatusSnapshot, String> {
    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let devices = match data.get("devices") {
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("device").and_then(Value::as_str);
                match name.map(str::parse::<DeviceId>) {
                    Some(Ok(device)) => Some(parse_report(device, entry)),
                    Some(Err(_)) => {
                        tracing::debug!(device = name, "Skipping status for unknown device");
                        None
                    }
                    None => Some(Err("status entry without 'device'".to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Object(entries)) => entries
            .iter()
            .filter_map(|(name, entry)| match name.parse::<DeviceId>() {
                Ok(device) => Some(parse_report(device, entry)),
                Err(_) => {
                    tracing::debug!(device = %name, "Skipping status for unknown device");
                    None
                }
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err("'devices' must be a list or an object".to_string()),
        None => return Err("missing 'devices'".to_string()),
    };

    Ok(StatusSnapshot { devices, timestamp })
}

fn parse_report(device: DeviceId, entry: &Value) -> Result<DeviceStatusReport, String> {
    let status = entry
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{device}: missing 'status'"))?;
    Ok(DeviceStatusReport {
        device,
        status: HealthState::from_wire(status),
        last_seen: entry
            .get("last_seen")
            .and_then(Value::as_str)
            .map(str::to_owned),
        data_count: entry.get("data_count").and_then(Value::as_u64).unwrap_or(0),
        heartbeat_interval_secs: entry
            .get("heartbeat_interval")
            .or_else(|| entry.get("heartbeat_interval_secs"))
            .and_then(Value::as_f64),
        error: entry.get("error").and_then(Value::as_str).map(str::to_owned),
    })
}

/// Turn a `GET /device_data/{device}` body into a sample.
#[must_use]
pub fn sample_from_poll(device: DeviceId, body: &Value) -> DeviceSample {
    DeviceSample {
        device,
        data: body.get("data").cloned().unwrap_or_else(|| body.clone()),
        timestamp: body
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

/// Fan a `GET /device_data/` body out into one sample per known device.
#[must_use]
pub fn samples_from_bulk(body: &Value) -> Vec<DeviceSample> {
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let Some(devices) = body.get("devices").and_then(Value::as_object) else {
        return Vec::new();
    };
    DeviceId::ALL
        .iter()
        .filter_map(|device| {
            devices.get(device.as_str()).map(|data| DeviceSample {
                device: *device,
                data: data.clone(),
                timestamp: timestamp.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_new_status_envelope() {
        let raw = json!({
            "type": "device_status_update",
            "data": {
                "devices": [
                    {"device": "lcu", "status": "online", "last_seen": "2024-05-01T10:00:00.123456", "data_count": 12},
                    {"device": "sdu", "status": "warning", "last_seen": null, "data_count": 0}
                ],
                "timestamp": "2024-05-01T10:00:01"
            }
        })
        .to_string();

        let InboundEvent::DeviceStatusUpdate(snapshot) = decode_inbound_frame(&raw).unwrap() else {
            panic!("expected status update");
        };
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.devices[0].status, HealthState::Online);
        assert_eq!(snapshot.devices[0].data_count, 12);
        assert_eq!(snapshot.devices[1].status, HealthState::Warning);
        assert!(snapshot.devices[1].last_seen.is_none());
    }

    #[test]
    fn normalizes_legacy_snapshot_without_envelope() {
        let raw = json!({
            "devices": {
                "lcu": {"status": "connected", "last_seen": "2024-05-01T10:00:00"},
                "dcu": {"status": "error", "error": "overcurrent"},
                "sdu": {"status": "disconnected"}
            },
            "timestamp": "2024-05-01T10:00:01"
        })
        .to_string();

        let event = decode_inbound_frame(&raw).unwrap();
        assert_eq!(event.kind(), EventKind::DeviceStatusUpdate);
        let InboundEvent::DeviceStatusUpdate(snapshot) = event else {
            unreachable!()
        };
        let by_device = |d: DeviceId| snapshot.devices.iter().find(|r| r.device == d).unwrap();
        assert_eq!(by_device(DeviceId::Lcu).status, HealthState::Online);
        assert_eq!(by_device(DeviceId::Dcu).status, HealthState::Warning);
        assert_eq!(by_device(DeviceId::Dcu).error.as_deref(), Some("overcurrent"));
        assert_eq!(by_device(DeviceId::Sdu).status, HealthState::Offline);
    }

    #[test]
    fn legacy_device_status_envelope_uses_map_shape() {
        let raw = r#"{"type":"device_status","data":{"devices":{"lcu":{"status":"connected"}}}}"#;
        let event = decode_inbound_frame(raw).unwrap();
        assert_eq!(event.kind(), EventKind::DeviceStatusUpdate);
    }

    #[test]
    fn routes_device_frames_by_type() {
        let lcu = decode_inbound_frame(r#"{"type":"lcu_data","data":{"position":3.5}}"#).unwrap();
        assert_eq!(lcu.kind(), EventKind::LcuData);

        let dcu = decode_inbound_frame(r#"{"type":"dcu_status","data":{"state":"idle"}}"#).unwrap();
        assert_eq!(dcu.kind(), EventKind::DcuStatus);

        let sdu = decode_inbound_frame(
            r#"{"type":"sdu_data","data":{"load":2.0,"timestamp":"2024-05-01T10:00:00"}}"#,
        )
        .unwrap();
        let InboundEvent::DeviceData(sample) = sdu else {
            panic!("expected sample");
        };
        assert_eq!(sample.device, DeviceId::Sdu);
        assert_eq!(sample.timestamp.as_deref(), Some("2024-05-01T10:00:00"));
    }

    #[test]
    fn unknown_types_and_plain_objects_are_generic() {
        let event = decode_inbound_frame(r#"{"type":"video_ready","data":{"id":1}}"#).unwrap();
        assert!(matches!(event, InboundEvent::Generic { ref kind, .. } if kind == "video_ready"));

        let event = decode_inbound_frame(r#"{"lcu_position": 4}"#).unwrap();
        assert!(matches!(event, InboundEvent::Generic { ref kind, .. } if kind == "data"));
        assert_eq!(event.kind(), EventKind::Generic);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode_inbound_frame("{not json"), Err(FrameError::Json(_))));
        assert!(matches!(decode_inbound_frame("[1,2]"), Err(FrameError::NotAnObject)));
        assert!(matches!(
            decode_inbound_frame(r#"{"type":"device_status_update","data":{"devices":7}}"#),
            Err(FrameError::Payload { .. })
        ));
        assert!(matches!(
            decode_inbound_frame(r#"{"type":"device_status_update","data":{"devices":[{"device":"lcu"}]}}"#),
            Err(FrameError::Payload { .. })
        ));
    }

    #[test]
    fn unknown_devices_are_skipped() {
        let snapshot = parse_status_snapshot(&json!({
            "devices": [{"device": "mcu", "status": "online"}, {"device": "dcu", "status": "offline"}]
        }))
        .unwrap();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].device, DeviceId::Dcu);
    }

    #[test]
    fn poll_bodies_become_samples() {
        let sample = sample_from_poll(
            DeviceId::Lcu,
            &json!({"device": "lcu", "data": {"pos": 1}, "timestamp": "2024-05-01T10:00:00"}),
        );
        assert_eq!(sample.data, json!({"pos": 1}));

        let samples = samples_from_bulk(&json!({
            "devices": {"sdu": {"load": 1}, "lcu": {"pos": 2}},
            "timestamp": "2024-05-01T10:00:00"
        }));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].device, DeviceId::Lcu);
        assert_eq!(samples[1].device, DeviceId::Sdu);
    }
}
