//! In-memory history store.

use super::{GatewayError, GatewayResult, PersistenceGateway, RecordId};
use crate::event::{DeviceAction, TelemetryReading};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    telemetry: Vec<TelemetryReading>,
    actions: Vec<DeviceAction>,
}

/// History store kept in process memory.
///
/// Used when no database is configured, and by tests. Writes can be made to
/// fail on demand with [`MemoryGateway::set_fail_writes`].
#[derive(Debug, Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryGateway {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a stored action, as if written by an earlier run.
    pub fn seed_action(&self, action: DeviceAction) {
        self.lock().actions.push(action);
    }

    /// Every stored telemetry reading, oldest first.
    #[must_use]
    pub fn telemetry(&self) -> Vec<TelemetryReading> {
        self.lock().telemetry.clone()
    }

    /// Every stored action, oldest first.
    #[must_use]
    pub fn actions(&self) -> Vec<DeviceAction> {
        self.lock().actions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> GatewayResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn append_telemetry(&self, reading: &TelemetryReading) -> GatewayResult<RecordId> {
        self.check_writable()?;
        let mut tables = self.lock();
        tables.telemetry.push(reading.clone());
        Ok(tables.telemetry.len() as RecordId)
    }

    async fn append_device_action(&self, device: &str, action: &str) -> GatewayResult<RecordId> {
        self.check_writable()?;
        let mut tables = self.lock();
        tables.actions.push(DeviceAction {
            device: device.to_string(),
            action: action.to_string(),
            timestamp: Utc::now(),
        });
        Ok(tables.actions.len() as RecordId)
    }

    async fn latest_telemetry(&self) -> GatewayResult<Option<TelemetryReading>> {
        Ok(self.lock().telemetry.last().cloned())
    }

    async fn latest_action_per_device(&self) -> GatewayResult<Vec<DeviceAction>> {
        // Later entries win; ties on timestamp resolve to the later write.
        let mut latest: BTreeMap<String, DeviceAction> = BTreeMap::new();
        for action in &self.lock().actions {
            match latest.get(&action.device) {
                Some(current) if current.timestamp > action.timestamp => {}
                _ => {
                    latest.insert(action.device.clone(), action.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
