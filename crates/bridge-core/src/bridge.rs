//! Bridge glue.
//!
//! [`Bridge`] ties the pieces together: broker messages come in through
//! [`Bridge::handle_broker_message`], viewers through
//! [`Bridge::connect_client`] / [`Bridge::disconnect_client`], and commands
//! through [`Bridge::issue_command`]. The caller serializes those inputs on
//! one intake loop; the bridge itself never blocks on persistence unless
//! strict mode is enabled.

use crate::device::{DeviceKey, DeviceTable, DEFAULT_TELEMETRY_TOPIC};
use crate::event::{StatusEvent, TelemetryReading, ON_TOKEN};
use crate::gateway::PersistenceGateway;
use crate::normalizer::{self, Normalized, ParseError};
use crate::persist::{PersistenceQueue, PersistenceWorker};
use crate::registry::{ClientRegistry, ClientSession, SessionId};
use crate::relay::{CommandPublisher, CommandRelay, RelayError};
use crate::state::DeviceStateStore;
use crate::topic::{RouteError, TopicRoute, TopicRouter};
use dashmap::DashSet;
use iot_bridge_protocol::DeviceStates;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Bridge construction errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid topic configuration: {0}")]
    Route(#[from] RouteError),
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Topic carrying sensor telemetry.
    pub telemetry_topic: String,
    /// Await each device-action write and drop the status broadcast if it
    /// fails. Off by default: viewers see every status regardless of the
    /// store.
    pub gate_status_on_persistence: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            telemetry_topic: DEFAULT_TELEMETRY_TOPIC.to_string(),
            gate_status_on_persistence: false,
        }
    }
}

/// Result of processing one broker message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Telemetry was broadcast.
    Telemetry { recipients: usize },
    /// A device status was applied and broadcast.
    Status {
        device: DeviceKey,
        /// Whether the on/off state flipped.
        changed: bool,
        recipients: usize,
    },
    /// The payload was malformed; nothing was stored or broadcast.
    Rejected(ParseError),
    /// The topic is not one the bridge knows.
    Unrecognized,
    /// Strict mode: the write failed, so the broadcast was dropped.
    Suppressed { device: DeviceKey },
}

/// Message counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    telemetry: AtomicU64,
    status: AtomicU64,
    rejected: AtomicU64,
    unrecognized: AtomicU64,
    suppressed: AtomicU64,
}

impl BridgeStats {
    #[must_use]
    pub fn telemetry(&self) -> u64 {
        self.telemetry.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unrecognized(&self) -> u64 {
        self.unrecognized.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

/// The broker-to-viewer bridge.
pub struct Bridge {
    devices: Arc<DeviceTable>,
    router: TopicRouter,
    state: DeviceStateStore,
    registry: ClientRegistry,
    persistence: PersistenceQueue,
    gateway: Arc<dyn PersistenceGateway>,
    relay: CommandRelay,
    warned_topics: DashSet<String>,
    stats: BridgeStats,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge and the persistence worker it feeds.
    ///
    /// The worker must be spawned for writes to reach `gateway`.
    ///
    /// # Errors
    ///
    /// Returns an error if the telemetry topic is empty or collides with a
    /// device topic.
    pub fn new(
        devices: DeviceTable,
        config: BridgeConfig,
        gateway: Arc<dyn PersistenceGateway>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Result<(Self, PersistenceWorker), BridgeError> {
        let devices = Arc::new(devices);
        let router = TopicRouter::new(config.telemetry_topic.clone(), &devices)?;
        let (persistence, worker) = PersistenceQueue::new(Arc::clone(&gateway));

        let bridge = Self {
            state: DeviceStateStore::new(&devices),
            relay: CommandRelay::new(Arc::clone(&devices), publisher),
            registry: ClientRegistry::new(),
            warned_topics: DashSet::new(),
            stats: BridgeStats::default(),
            devices,
            router,
            persistence,
            gateway,
            config,
        };
        Ok((bridge, worker))
    }

    /// Seed the last reading and device states from the history store.
    ///
    /// Failures are logged; the bridge starts with empty state instead.
    /// Returns the number of devices whose state was restored.
    pub async fn bootstrap(&self) -> usize {
        match self.gateway.latest_telemetry().await {
            Ok(Some(reading)) => {
                debug!(timestamp = %reading.timestamp, "Restored latest telemetry");
                self.registry.set_latest_telemetry(reading);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load latest telemetry"),
        }

        let actions = match self.gateway.latest_action_per_device().await {
            Ok(actions) => actions,
            Err(e) => {
                warn!(error = %e, "Failed to load device history");
                return 0;
            }
        };

        let mut restored = 0;
        for action in actions {
            let Some(device) = self.devices.resolve(&action.device) else {
                warn!(device = %action.device, "Skipping history for unknown device");
                continue;
            };
            if self.state.update(&device.key, action.action == ON_TOKEN).is_ok() {
                restored += 1;
            }
        }

        info!(
            backend = self.gateway.name(),
            restored,
            states = ?self.state.snapshot(),
            "Bridge state bootstrapped"
        );
        restored
    }

    /// Process one broker message.
    pub async fn handle_broker_message(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let route = self.router.route(topic);
        if route == TopicRoute::Unrecognized {
            self.stats.unrecognized.fetch_add(1, Ordering::Relaxed);
            if self.warned_topics.insert(topic.to_string()) {
                warn!(topic = %topic, "Message on unrecognized topic, check subscriptions");
            }
            return IngestOutcome::Unrecognized;
        }

        match normalizer::normalize(&route, payload) {
            Ok(Normalized::Telemetry(reading)) => self.on_telemetry(reading),
            Ok(Normalized::Status(event)) => self.on_status(event).await,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %topic, error = %e, "Dropping malformed message");
                IngestOutcome::Rejected(e)
            }
        }
    }

    fn on_telemetry(&self, reading: TelemetryReading) -> IngestOutcome {
        self.stats.telemetry.fetch_add(1, Ordering::Relaxed);
        self.persistence.telemetry(reading.clone());
        let recipients = self.registry.broadcast_telemetry(&reading);
        debug!(
            temperature = reading.temperature,
            humidity = reading.humidity,
            light = reading.light,
            recipients,
            "Telemetry broadcast"
        );
        IngestOutcome::Telemetry { recipients }
    }

    async fn on_status(&self, event: StatusEvent) -> IngestOutcome {
        let Some(device) = self.devices.get(event.device.as_str()) else {
            // The router only yields configured keys.
            error!(device = %event.device, "Status for device missing from table");
            return IngestOutcome::Unrecognized;
        };

        let is_on = event.is_on();
        let previous = match self.state.update(&event.device, is_on) {
            Ok(previous) => previous,
            Err(e) => {
                error!(error = %e, "Failed to apply device status");
                return IngestOutcome::Unrecognized;
            }
        };

        if self.config.gate_status_on_persistence {
            if let Err(e) = self
                .gateway
                .append_device_action(&device.label, &event.action)
                .await
            {
                self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
                warn!(device = %device.key, error = %e, "Device action not stored, broadcast suppressed");
                return IngestOutcome::Suppressed {
                    device: device.key.clone(),
                };
            }
        } else {
            self.persistence
                .device_action(device.label.clone(), event.action.clone());
        }

        self.stats.status.fetch_add(1, Ordering::Relaxed);
        let recipients = self.registry.broadcast_status(&event, &device.label);
        IngestOutcome::Status {
            device: device.key.clone(),
            changed: previous != is_on,
            recipients,
        }
    }

    /// Register a viewer and queue its initial telemetry and state pushes.
    pub fn connect_client(&self, session: ClientSession) {
        self.registry.on_connect(session, self.state.snapshot());
    }

    /// Deregister a viewer. Returns `true` if it was registered.
    pub fn disconnect_client(&self, id: &SessionId) -> bool {
        self.registry.on_disconnect(id)
    }

    /// Relay a viewer command to the broker.
    ///
    /// # Errors
    ///
    /// See [`CommandRelay::issue_command`].
    pub async fn issue_command(&self, device: &str, action: &str) -> Result<(), RelayError> {
        self.relay.issue_command(device, action).await
    }

    /// Current device states, keyed by device key.
    #[must_use]
    pub fn snapshot(&self) -> DeviceStates {
        self.state.snapshot()
    }

    /// Topics the broker connection must subscribe to.
    #[must_use]
    pub fn subscriptions(&self) -> &[String] {
        self.router.subscriptions()
    }

    #[must_use]
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    #[must_use]
    pub fn persistence(&self) -> &PersistenceQueue {
        &self.persistence
    }

    #[must_use]
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("devices", &self.devices.len())
            .field("clients", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
