//! # iot-bridge-protocol
//!
//! Wire protocol between the IoT bridge and its live viewers.
//!
//! Viewers exchange named events with the bridge. Each event is an
//! `{"event": "<name>", "data": {...}}` envelope, carried either as a JSON
//! text frame or as a length-prefixed MessagePack binary frame.
//!
//! ## Server events
//!
//! - `connected` - Session hello
//! - `sensor-data` - Latest telemetry reading
//! - `device-status` - A device reported a status change
//! - `device-states` - Full on/off snapshot of every configured device
//! - `device-control-error` - A viewer command could not be relayed
//!
//! ## Client events
//!
//! - `device-control` - Ask a device to switch on or off
//! - `ping` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use iot_bridge_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode_text(r#"{"event":"device-control","data":{"device":"fan","action":"on"}}"#).unwrap();
//! assert_eq!(event, ClientEvent::device_control("fan", "on"));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode_text, encode_text, ProtocolError};
pub use events::{
    ClientEvent, ControlError, DeviceStates, DeviceStatus, EventType, SensorData, ServerEvent,
    PROTOCOL_VERSION,
};
