//! Command relay.
//!
//! Validates a viewer's `(device, action)` request against the device table
//! and republishes the literal action on the device's control topic. The
//! relay does not wait for the device: confirmation arrives later as a
//! status message.

use crate::device::DeviceTable;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Publishes payloads to the broker.
#[async_trait]
pub trait CommandPublisher: Send + Sync + 'static {
    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), String>;
}

/// Command relay errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The device is not configured. Nothing was published.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The action is empty. Nothing was published.
    #[error("Action cannot be empty")]
    EmptyAction,

    /// The broker refused the publish.
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Relays viewer commands to device control topics.
pub struct CommandRelay {
    devices: Arc<DeviceTable>,
    publisher: Arc<dyn CommandPublisher>,
}

impl CommandRelay {
    /// Create a relay over `publisher`.
    #[must_use]
    pub fn new(devices: Arc<DeviceTable>, publisher: Arc<dyn CommandPublisher>) -> Self {
        Self { devices, publisher }
    }

    /// Issue `action` to `device` (key or label).
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown, the action is empty, or
    /// the publish fails.
    pub async fn issue_command(&self, device: &str, action: &str) -> Result<(), RelayError> {
        let Some(target) = self.devices.resolve(device) else {
            warn!(device = %device, action = %action, "Command for unknown device");
            return Err(RelayError::UnknownDevice(device.to_string()));
        };
        if action.trim().is_empty() {
            return Err(RelayError::EmptyAction);
        }

        self.publisher
            .publish(&target.control_topic, Bytes::copy_from_slice(action.as_bytes()))
            .await
            .map_err(RelayError::Publish)?;

        debug!(device = %target.key, topic = %target.control_topic, action = %action, "Command published");
        Ok(())
    }
}

impl std::fmt::Debug for CommandRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRelay")
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}
