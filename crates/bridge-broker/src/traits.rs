//! Broker transport abstraction traits.
//!
//! These traits define what the connection manager needs from a broker
//! client library, so the reconnect logic can run against rumqttc in
//! production and a scripted transport in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Client identity presented to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate `<prefix>_<8 random hex digits>`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}", prefix, &random[..8]))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Delivery guarantee for subscribe and publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Bytes,
}

impl Inbound {
    /// Create a new inbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker refused or could not be reached.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connect attempt timed out.
    #[error("Connect timed out")]
    Timeout,

    /// An established connection dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No live connection to publish on.
    #[error("Not connected to broker")]
    NotConnected,

    /// Subscription request failed.
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Publish request failed.
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// A broker that can be connected to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session under `client_id`.
    ///
    /// Resolves once the broker has accepted the session.
    async fn connect(&self, client_id: &ClientId) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "mqtt").
    fn name(&self) -> &'static str;
}

/// An established broker session.
#[async_trait]
pub trait Connection: Send {
    /// Handle for issuing requests on this session.
    fn client(&self) -> Arc<dyn BrokerClient>;

    /// Drive the session until the next inbound message.
    ///
    /// Returns `None` if the broker closed the session cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Send a disconnect and wait for in-flight requests to drain.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Request side of a broker session.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Subscribe to one topic.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError>;
}
