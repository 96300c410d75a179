//! # iot-bridge-broker
//!
//! Broker side of the IoT bridge.
//!
//! - **Traits** - `Transport`, `Connection` and `BrokerClient`, the narrow
//!   interface the bridge needs from a pub/sub client
//! - **Manager** - Connect, subscribe, forward, reconnect on a fixed interval
//! - **Rumqtt** - MQTT implementation of the traits on top of rumqttc
//!
//! ```rust,ignore
//! use iot_bridge_broker::{ConnectionManager, ManagerConfig, RumqttSettings, RumqttTransport};
//!
//! let transport = Arc::new(RumqttTransport::new(RumqttSettings::default()));
//! let (manager, handle, mut events) = ConnectionManager::new(transport, ManagerConfig::default());
//! tokio::spawn(manager.run());
//! while let Some(event) = events.recv().await {
//!     // Route messages
//! }
//! ```

pub mod manager;
pub mod traits;

#[cfg(feature = "rumqtt")]
pub mod rumqtt;

pub use manager::{BrokerEvent, BrokerHandle, ConnectionManager, ConnectionState, ManagerConfig};
pub use traits::{BrokerClient, ClientId, Connection, Inbound, QoS, Transport, TransportError};

#[cfg(feature = "rumqtt")]
pub use rumqtt::{RumqttSettings, RumqttTransport};
