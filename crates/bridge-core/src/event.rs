//! Domain events produced by the normalizer.
//!
//! These are transient: they live for the processing of one broker message
//! and are handed to persistence and fan-out.

use crate::device::DeviceKey;
use chrono::{DateTime, Utc};
use iot_bridge_protocol::{DeviceStatus, SensorData};
use serde::{Deserialize, Serialize};

/// The only status token treated as "on".
pub const ON_TOKEN: &str = "on";

/// A telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub temperature: f64,
    pub humidity: f64,
    pub light: i64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryReading {
    /// Create a reading stamped with the current time.
    #[must_use]
    pub fn new(temperature: f64, humidity: f64, light: i64) -> Self {
        Self {
            temperature,
            humidity,
            light,
            timestamp: Utc::now(),
        }
    }

    /// Viewer representation.
    #[must_use]
    pub fn to_sensor_data(&self) -> SensorData {
        SensorData {
            temperature: self.temperature,
            humidity: self.humidity,
            light: self.light,
            timestamp: self.timestamp,
        }
    }
}

/// A device reported its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub device: DeviceKey,
    /// Raw token, e.g. `on` or `off`.
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Create a status event stamped with the current time.
    #[must_use]
    pub fn new(device: DeviceKey, action: impl Into<String>) -> Self {
        Self {
            device,
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this status means the device is on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.action == ON_TOKEN
    }

    /// Viewer representation, using the device's human-readable label.
    #[must_use]
    pub fn to_device_status(&self, label: &str) -> DeviceStatus {
        DeviceStatus {
            device: label.to_string(),
            status: self.action.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A recorded device action, as returned by the history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAction {
    /// Device label as stored (e.g. `Air condition`).
    pub device: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}
