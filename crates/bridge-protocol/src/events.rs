//! Event types for the viewer protocol.
//!
//! Events are the unit of communication between the bridge and a viewer.
//! Every event serializes as an adjacently tagged envelope so that the
//! same shape works for JSON text frames and MessagePack binary frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current protocol version, announced in the `connected` hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Device key to on/off snapshot, as pushed in `device-states`.
pub type DeviceStates = BTreeMap<String, bool>;

/// Event names, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    SensorData,
    DeviceStatus,
    DeviceStates,
    DeviceControlError,
    Pong,
    DeviceControl,
    Ping,
}

impl EventType {
    /// The event name as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::SensorData => "sensor-data",
            EventType::DeviceStatus => "device-status",
            EventType::DeviceStates => "device-states",
            EventType::DeviceControlError => "device-control-error",
            EventType::Pong => "pong",
            EventType::DeviceControl => "device-control",
            EventType::Ping => "ping",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A telemetry reading as seen by viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub temperature: f64,
    pub humidity: f64,
    pub light: i64,
    pub timestamp: DateTime<Utc>,
}

/// A device status change as seen by viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Human-readable device label (e.g. `Air condition`).
    pub device: String,
    /// Raw status token reported by the device.
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Rejection of a viewer's `device-control` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlError {
    pub device: String,
    pub action: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Events sent from the bridge to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Session established.
    #[serde(rename = "connected")]
    Connected {
        /// Unique session identifier.
        session_id: String,
        /// Protocol version spoken by the bridge.
        version: u8,
    },

    /// Latest telemetry reading.
    #[serde(rename = "sensor-data")]
    SensorData(SensorData),

    /// A device reported a new status.
    #[serde(rename = "device-status")]
    DeviceStatus(DeviceStatus),

    /// Snapshot of every configured device.
    #[serde(rename = "device-states")]
    DeviceStates(DeviceStates),

    /// A command from this viewer failed validation or relay.
    #[serde(rename = "device-control-error")]
    DeviceControlError(ControlError),

    /// Keepalive reply.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ServerEvent::Connected { .. } => EventType::Connected,
            ServerEvent::SensorData(_) => EventType::SensorData,
            ServerEvent::DeviceStatus(_) => EventType::DeviceStatus,
            ServerEvent::DeviceStates(_) => EventType::DeviceStates,
            ServerEvent::DeviceControlError(_) => EventType::DeviceControlError,
            ServerEvent::Pong { .. } => EventType::Pong,
        }
    }

    /// Create a new Connected event.
    #[must_use]
    pub fn connected(session_id: impl Into<String>) -> Self {
        ServerEvent::Connected {
            session_id: session_id.into(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Create a new DeviceControlError event stamped with the current time.
    #[must_use]
    pub fn control_error(
        device: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerEvent::DeviceControlError(ControlError {
            device: device.into(),
            action: action.into(),
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    /// Create a new Pong event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }
}

/// Events sent from a viewer to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Ask a device to perform an action.
    #[serde(rename = "device-control")]
    DeviceControl {
        /// Device key or label.
        device: String,
        /// Action token, published verbatim (`on` / `off`).
        action: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ClientEvent::DeviceControl { .. } => EventType::DeviceControl,
            ClientEvent::Ping { .. } => EventType::Ping,
        }
    }

    /// Create a new DeviceControl event.
    #[must_use]
    pub fn device_control(device: impl Into<String>, action: impl Into<String>) -> Self {
        ClientEvent::DeviceControl {
            device: device.into(),
            action: action.into(),
        }
    }

    /// Create a new Ping event.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientEvent::Ping { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type() {
        let states = ServerEvent::DeviceStates(DeviceStates::new());
        assert_eq!(states.event_type(), EventType::DeviceStates);
        assert_eq!(states.event_type().as_str(), "device-states");

        let control = ClientEvent::device_control("fan", "on");
        assert_eq!(control.event_type(), EventType::DeviceControl);
    }

    #[test]
    fn test_device_states_shape() {
        let mut states = DeviceStates::new();
        states.insert("ac".to_string(), false);
        states.insert("light".to_string(), true);

        let value = serde_json::to_value(ServerEvent::DeviceStates(states)).unwrap();
        assert_eq!(
            value,
            json!({"event": "device-states", "data": {"ac": false, "light": true}})
        );
    }

    #[test]
    fn test_sensor_data_shape() {
        let timestamp = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = ServerEvent::SensorData(SensorData {
            temperature: 0.0,
            humidity: 61.5,
            light: 300,
            timestamp,
        });

        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["event"], "sensor-data");
        assert_eq!(value["data"]["temperature"], 0.0);
        assert_eq!(value["data"]["light"], 300);
        assert_eq!(value["data"]["timestamp"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_control_error_fields() {
        let event = ServerEvent::control_error("heater", "on", "Unknown device: heater");
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["event"], "device-control-error");
        assert_eq!(value["data"]["device"], "heater");
        assert_eq!(value["data"]["message"], "Unknown device: heater");
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn test_ping_without_timestamp() {
        let event: ClientEvent = serde_json::from_value(json!({"event": "ping", "data": {}})).unwrap();
        assert_eq!(event, ClientEvent::ping(None));
    }
}
