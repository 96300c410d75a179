//! Persistence gateway.
//!
//! The bridge writes telemetry and device actions to an external history
//! store and reads it back once at startup. The store itself is a
//! collaborator: the bridge only needs the four operations of
//! [`PersistenceGateway`].

use crate::event::{DeviceAction, TelemetryReading};
use async_trait::async_trait;
use thiserror::Error;

mod memory;
#[cfg(feature = "mysql")]
mod mysql;

pub use memory::MemoryGateway;
#[cfg(feature = "mysql")]
pub use mysql::{MySqlGateway, MySqlSettings};

/// Identifier of a stored record.
pub type RecordId = u64;

/// Persistence errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "mysql")]
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                GatewayError::Unavailable(err.to_string())
            }
            other => GatewayError::Storage(other.to_string()),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// History store operations used by the bridge.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Append a telemetry reading.
    async fn append_telemetry(&self, reading: &TelemetryReading) -> GatewayResult<RecordId>;

    /// Append a device action. `device` is the device label.
    async fn append_device_action(&self, device: &str, action: &str) -> GatewayResult<RecordId>;

    /// Most recent telemetry reading, if any was ever stored.
    async fn latest_telemetry(&self) -> GatewayResult<Option<TelemetryReading>>;

    /// Most recent action of every device that has one.
    async fn latest_action_per_device(&self) -> GatewayResult<Vec<DeviceAction>>;

    /// Backend name, for logs.
    fn name(&self) -> &'static str;
}
