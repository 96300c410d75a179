//! Client registry and fan-out.
//!
//! Tracks the connected viewer sessions and delivers events to them. Each
//! session owns an unbounded outbound queue, so a broadcast never blocks on
//! a slow viewer and preserves the order in which events were broadcast.

use crate::event::{StatusEvent, TelemetryReading};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use iot_bridge_protocol::{DeviceStates, ServerEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Counter for session identifiers.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a viewer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique session ID.
    #[must_use]
    pub fn generate() -> Self {
        let seq = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        Self(format!("session_{millis:x}_{seq}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sending half of a session's outbound queue.
pub type Outbound = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// A connected viewer.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    outbound: Outbound,
}

impl ClientSession {
    /// Create a session delivering into `outbound`.
    #[must_use]
    pub fn new(id: SessionId, outbound: Outbound) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Create a session with a fresh ID and its receiving queue.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(SessionId::generate(), tx), rx)
    }

    /// Queue an event for this session. Returns `false` if the viewer is gone.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.outbound.send(event).is_ok()
    }
}

/// Summary of a connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
}

/// Registry of connected viewers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: DashMap<SessionId, ClientSession>,
    /// Most recent telemetry that was broadcast.
    latest_telemetry: RwLock<Option<TelemetryReading>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and push it the current picture.
    ///
    /// Queues the latest telemetry reading (if any was ever observed) and
    /// then the device snapshot, before any later broadcast.
    pub fn on_connect(&self, session: ClientSession, snapshot: DeviceStates) {
        let id = session.id.clone();

        if let Some(reading) = self.latest_telemetry() {
            session.send(Arc::new(ServerEvent::SensorData(reading.to_sensor_data())));
        }
        session.send(Arc::new(ServerEvent::DeviceStates(snapshot)));

        self.sessions.insert(id.clone(), session);
        info!(connection = %id, clients = self.sessions.len(), "Client connected");
    }

    /// Remove a session. Returns `true` if it was registered.
    pub fn on_disconnect(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            info!(connection = %id, clients = self.sessions.len(), "Client disconnected");
        }
        removed
    }

    /// Broadcast a telemetry reading and remember it for newcomers.
    ///
    /// Returns the number of sessions the event was queued for.
    pub fn broadcast_telemetry(&self, reading: &TelemetryReading) -> usize {
        self.set_latest_telemetry(reading.clone());
        self.broadcast(ServerEvent::SensorData(reading.to_sensor_data()))
    }

    /// Broadcast a device status change.
    ///
    /// Returns the number of sessions the event was queued for.
    pub fn broadcast_status(&self, event: &StatusEvent, label: &str) -> usize {
        let count = self.broadcast(ServerEvent::DeviceStatus(event.to_device_status(label)));
        debug!(device = %label, status = %event.action, recipients = count, "Broadcast device status");
        count
    }

    /// Send one event to every registered session.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut count = 0;
        for session in self.sessions.iter() {
            if session.send(Arc::clone(&event)) {
                count += 1;
            } else {
                // Stale sessions are removed on their disconnect signal.
                trace!(connection = %session.id, "Outbound queue closed");
            }
        }
        trace!(event = %event.event_type(), recipients = count, "Broadcast");
        count
    }

    /// Seed the latest telemetry without broadcasting it.
    pub fn set_latest_telemetry(&self, reading: TelemetryReading) {
        *self
            .latest_telemetry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }

    /// The most recent telemetry reading, if any.
    #[must_use]
    pub fn latest_telemetry(&self) -> Option<TelemetryReading> {
        self.latest_telemetry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Details of every connected session.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                connected_at: s.connected_at,
            })
            .collect()
    }
}
