//! Device table for the bridge.
//!
//! The device set is fixed configuration: every device has one canonical
//! key, one human-readable label, one status topic and one control topic.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Default telemetry topic.
pub const DEFAULT_TELEMETRY_TOPIC: &str = "iot/sensors/data";

/// Canonical identifier of a device (e.g. `light`, `fan`, `ac`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Create a new device key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DeviceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A controllable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Canonical key.
    pub key: DeviceKey,
    /// Human-readable label, as recorded in the action history.
    pub label: String,
    /// Topic the device reports its status on.
    pub status_topic: String,
    /// Topic the device receives commands on.
    pub control_topic: String,
}

impl Device {
    /// Create a new device.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        status_topic: impl Into<String>,
        control_topic: impl Into<String>,
    ) -> Self {
        Self {
            key: DeviceKey::new(key),
            label: label.into(),
            status_topic: status_topic.into(),
            control_topic: control_topic.into(),
        }
    }
}

/// Device table errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceTableError {
    /// No devices configured.
    #[error("Device table is empty")]
    Empty,

    /// A device is missing its key or one of its topics.
    #[error("Device '{0}' has an empty key, label or topic")]
    Incomplete(String),

    /// Two devices normalize to the same name.
    #[error("Duplicate device name: {0}")]
    DuplicateName(String),

    /// Two devices share a topic.
    #[error("Duplicate topic: {0}")]
    DuplicateTopic(String),
}

/// Normalize a device key or label for lookup.
///
/// Lowercases and strips all whitespace, so `"Air condition"` becomes
/// `"aircondition"`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The configured device set.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    /// Build a validated device table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is empty, a device is incomplete, or
    /// names/topics collide.
    pub fn new(devices: Vec<Device>) -> Result<Self, DeviceTableError> {
        if devices.is_empty() {
            return Err(DeviceTableError::Empty);
        }

        let mut names = HashSet::new();
        let mut topics = HashSet::new();

        for device in &devices {
            if device.key.as_str().trim().is_empty()
                || device.label.trim().is_empty()
                || device.status_topic.is_empty()
                || device.control_topic.is_empty()
            {
                return Err(DeviceTableError::Incomplete(device.key.to_string()));
            }

            let key = normalize_name(device.key.as_str());
            let label = normalize_name(&device.label);
            if !names.insert(key.clone()) {
                return Err(DeviceTableError::DuplicateName(key));
            }
            if label != key && !names.insert(label.clone()) {
                return Err(DeviceTableError::DuplicateName(label));
            }

            for topic in [&device.status_topic, &device.control_topic] {
                if !topics.insert(topic.as_str()) {
                    return Err(DeviceTableError::DuplicateTopic(topic.clone()));
                }
            }
        }

        Ok(Self { devices })
    }

    /// All devices, in configuration order.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of configured devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always `false`: construction rejects empty tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All device keys, in configuration order.
    pub fn keys(&self) -> impl Iterator<Item = &DeviceKey> {
        self.devices.iter().map(|d| &d.key)
    }

    /// Look up a device by its canonical key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.key.as_str() == key)
    }

    /// Resolve a key or label to a device, ignoring case and whitespace.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&Device> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        self.devices.iter().find(|d| {
            normalize_name(d.key.as_str()) == wanted || normalize_name(&d.label) == wanted
        })
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self {
            devices: default_devices(),
        }
    }
}

/// The device set of the reference deployment.
#[must_use]
pub fn default_devices() -> Vec<Device> {
    vec![
        Device::new(
            "light",
            "Light",
            "iot/led/light/status",
            "iot/led/light/command",
        ),
        Device::new("fan", "Fan", "iot/led/fan/status", "iot/led/fan/command"),
        Device::new(
            "ac",
            "Air condition",
            "iot/led/ac/status",
            "iot/led/ac/command",
        ),
    ]
}
