//! # iot-bridge-core
//!
//! Domain logic of the IoT bridge, independent of any transport.
//!
//! - **Device** - The configured device table and name resolution
//! - **Topic** - Exact mapping from broker topic to domain entity
//! - **Normalizer** - Raw payloads to typed telemetry and status events
//! - **State** - Canonical on/off state per device
//! - **Registry** - Viewer sessions and fan-out
//! - **Relay** - Viewer commands back to the broker
//! - **Gateway** - History store interface, with memory and MySQL backends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌──────────┐
//! │  Broker  │──▶│  Router  │──▶│ Normalizer │──▶│  State   │──▶│ Registry │──▶ viewers
//! └──────────┘   └──────────┘   └────────────┘   └──────────┘   └──────────┘
//!      ▲                               │
//!      │                               ▼
//! ┌──────────┐                  ┌────────────┐
//! │  Relay   │◀── viewers       │  Gateway   │
//! └──────────┘                  └────────────┘
//! ```

pub mod bridge;
pub mod device;
pub mod event;
pub mod gateway;
pub mod normalizer;
pub mod persist;
pub mod registry;
pub mod relay;
pub mod state;
pub mod topic;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgeStats, IngestOutcome};
pub use device::{Device, DeviceKey, DeviceTable, DeviceTableError, DEFAULT_TELEMETRY_TOPIC};
pub use event::{DeviceAction, StatusEvent, TelemetryReading};
pub use gateway::{GatewayError, MemoryGateway, PersistenceGateway, RecordId};
pub use normalizer::{Normalized, ParseError, Payload};
pub use persist::{PersistenceQueue, PersistenceWorker};
pub use registry::{ClientRegistry, ClientSession, SessionId};
pub use relay::{CommandPublisher, CommandRelay, RelayError};
pub use state::{DeviceStateStore, StateError};
pub use topic::{RouteError, TopicRoute, TopicRouter};
