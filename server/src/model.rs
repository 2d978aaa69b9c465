use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a tracker device.
///
/// `Online` decays to `Unknown` when no traffic is seen for the configured
/// status timeout; a transport-level disconnect moves the device to `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    /// Parse a status stored as TEXT in the database. Anything unrecognized
    /// (including NULL mapped to "") is treated as `Unknown`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// A tracker device as known to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: Option<String>,
    /// Primary device-supplied identifier (e.g. an IMEI).
    pub unique_id: String,
    pub status: DeviceStatus,
    pub disabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub group_id: Option<i64>,
    /// Free-form per-device attributes (e.g. "speed_limit").
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Device {
    /// Read a numeric attribute, falling back to `default` when absent or
    /// not a number.
    pub fn attribute_f64(&self, key: &str, default: f64) -> f64 {
        self.attributes
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }
}

/// A single position report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub id: i64,
    pub device_id: i64,
    /// Time reported by the device (falls back to server receive time).
    pub fix_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed in knots.
    pub speed: f64,
    pub course: f64,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Synthetic event types emitted by the status state machine and the
/// state evaluators.
pub mod event_type {
    pub const DEVICE_ONLINE: &str = "deviceOnline";
    pub const DEVICE_OFFLINE: &str = "deviceOffline";
    pub const DEVICE_UNKNOWN: &str = "deviceUnknown";
    pub const DEVICE_MOVING: &str = "deviceMoving";
    pub const DEVICE_STOPPED: &str = "deviceStopped";
    pub const DEVICE_OVERSPEED: &str = "deviceOverspeed";
}

/// A recorded occurrence tied to a device (status change, motion, overspeed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub device_id: i64,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, device_id: i64) -> Self {
        Self {
            event_type: event_type.to_string(),
            device_id,
            event_time: Utc::now(),
            attributes: serde_json::Value::Null,
        }
    }

    /// The status event matching a new device status.
    pub fn for_status(status: DeviceStatus, device_id: i64) -> Self {
        let event_type = match status {
            DeviceStatus::Online => event_type::DEVICE_ONLINE,
            DeviceStatus::Offline => event_type::DEVICE_OFFLINE,
            DeviceStatus::Unknown => event_type::DEVICE_UNKNOWN,
        };
        Self::new(event_type, device_id)
    }
}

/// A node in the device-grouping forest. `group_id` points at the parent
/// group, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub group_id: Option<i64>,
}
