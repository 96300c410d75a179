//! Device state store.
//!
//! The single in-memory source of truth for whether each configured device
//! is on. Every configured key is present from construction onwards.

use crate::device::{DeviceKey, DeviceTable};
use iot_bridge_protocol::DeviceStates;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// State store errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// The key is not part of the configured device set.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

/// Canonical on/off state per device.
#[derive(Debug)]
pub struct DeviceStateStore {
    states: RwLock<BTreeMap<DeviceKey, bool>>,
}

impl DeviceStateStore {
    /// Create a store with every configured device off.
    #[must_use]
    pub fn new(devices: &DeviceTable) -> Self {
        let states = devices.keys().map(|key| (key.clone(), false)).collect();
        Self {
            states: RwLock::new(states),
        }
    }

    /// Set a device's state, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not configured; the store is unchanged.
    pub fn update(&self, key: &DeviceKey, is_on: bool) -> Result<bool, StateError> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let slot = states
            .get_mut(key)
            .ok_or_else(|| StateError::UnknownDevice(key.to_string()))?;
        let previous = std::mem::replace(slot, is_on);
        debug!(device = %key, previous, current = is_on, "Device state updated");
        Ok(previous)
    }

    /// Current state of one device.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<bool> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Consistent copy of every device's state, keyed by device key.
    #[must_use]
    pub fn snapshot(&self) -> DeviceStates {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, on)| (key.to_string(), *on))
            .collect()
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store tracks no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
