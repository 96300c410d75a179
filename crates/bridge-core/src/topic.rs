//! Topic router.
//!
//! Maps a broker topic to the domain entity it carries. Matching is exact:
//! the broker subscription is restricted to known topics, so anything else
//! is a subscription/config mismatch.

use crate::device::{DeviceKey, DeviceTable};
use std::collections::HashMap;
use thiserror::Error;

/// Classification of a broker topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute {
    /// Sensor telemetry.
    Telemetry,
    /// Status report of the given device.
    Status(DeviceKey),
    /// Not a topic this bridge knows about.
    Unrecognized,
}

/// Router construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Telemetry topic is empty.
    #[error("Telemetry topic cannot be empty")]
    EmptyTelemetryTopic,

    /// A device status topic collides with the telemetry topic.
    #[error("Status topic of device '{0}' is the telemetry topic")]
    TelemetryCollision(DeviceKey),
}

/// Static topic lookup table.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    telemetry_topic: String,
    status_topics: HashMap<String, DeviceKey>,
    /// Subscription order: telemetry first, then devices in table order.
    subscriptions: Vec<String>,
}

impl TopicRouter {
    /// Build the router from the telemetry topic and the device table.
    ///
    /// # Errors
    ///
    /// Returns an error if the telemetry topic is empty or shared with a device.
    pub fn new(telemetry_topic: impl Into<String>, devices: &DeviceTable) -> Result<Self, RouteError> {
        let telemetry_topic = telemetry_topic.into();
        if telemetry_topic.is_empty() {
            return Err(RouteError::EmptyTelemetryTopic);
        }

        let mut status_topics = HashMap::with_capacity(devices.len());
        let mut subscriptions = Vec::with_capacity(devices.len() + 1);
        subscriptions.push(telemetry_topic.clone());

        for device in devices.devices() {
            if device.status_topic == telemetry_topic || device.control_topic == telemetry_topic {
                return Err(RouteError::TelemetryCollision(device.key.clone()));
            }
            status_topics.insert(device.status_topic.clone(), device.key.clone());
            subscriptions.push(device.status_topic.clone());
        }

        Ok(Self {
            telemetry_topic,
            status_topics,
            subscriptions,
        })
    }

    /// Classify a topic.
    #[must_use]
    pub fn route(&self, topic: &str) -> TopicRoute {
        if topic == self.telemetry_topic {
            return TopicRoute::Telemetry;
        }
        match self.status_topics.get(topic) {
            Some(key) => TopicRoute::Status(key.clone()),
            None => TopicRoute::Unrecognized,
        }
    }

    /// The telemetry topic.
    #[must_use]
    pub fn telemetry_topic(&self) -> &str {
        &self.telemetry_topic
    }

    /// Every topic the broker connection must subscribe to.
    #[must_use]
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DEFAULT_TELEMETRY_TOPIC};

    fn router() -> TopicRouter {
        TopicRouter::new(DEFAULT_TELEMETRY_TOPIC, &DeviceTable::default()).unwrap()
    }

    #[test]
    fn test_route_known_topics() {
        let router = router();

        assert_eq!(router.route("iot/sensors/data"), TopicRoute::Telemetry);
        assert_eq!(
            router.route("iot/led/ac/status"),
            TopicRoute::Status(DeviceKey::new("ac"))
        );
        assert_eq!(
            router.route("iot/led/fan/status"),
            TopicRoute::Status(DeviceKey::new("fan"))
        );
    }

    #[test]
    fn test_route_is_exact() {
        let router = router();

        // Control topics and near-misses are not status topics.
        assert_eq!(router.route("iot/led/fan/command"), TopicRoute::Unrecognized);
        assert_eq!(router.route("iot/led/fan/status/"), TopicRoute::Unrecognized);
        assert_eq!(router.route("iot/led/+/status"), TopicRoute::Unrecognized);
        assert_eq!(router.route(""), TopicRoute::Unrecognized);
    }

    #[test]
    fn test_subscriptions() {
        let router = router();
        assert_eq!(
            router.subscriptions(),
            &[
                "iot/sensors/data".to_string(),
                "iot/led/light/status".to_string(),
                "iot/led/fan/status".to_string(),
                "iot/led/ac/status".to_string(),
            ]
        );
    }

    #[test]
    fn test_telemetry_collision() {
        let devices =
            DeviceTable::new(vec![Device::new("fan", "Fan", "shared", "fan/command")]).unwrap();
        assert_eq!(
            TopicRouter::new("shared", &devices).unwrap_err(),
            RouteError::TelemetryCollision(DeviceKey::new("fan"))
        );
        assert_eq!(
            TopicRouter::new("", &devices).unwrap_err(),
            RouteError::EmptyTelemetryTopic
        );
    }
}
