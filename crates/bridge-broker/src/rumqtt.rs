//! MQTT transport built on rumqttc.
//!
//! One [`RumqttTransport::connect`] call creates a fresh `AsyncClient` /
//! `EventLoop` pair and polls it until the broker acknowledges the session.
//! The event loop is never reused after an error: the connection manager
//! reconnects with a new client identity instead.

use crate::traits::{BrokerClient, ClientId, Connection, Inbound, QoS, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Settings for [`RumqttTransport`].
#[derive(Debug, Clone)]
pub struct RumqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Capacity of the request channel between client and event loop.
    pub capacity: usize,
    /// Upper bound on waiting for DISCONNECT to flush on close.
    pub drain_timeout: Duration,
}

impl Default for RumqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            capacity: 64,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// MQTT transport.
#[derive(Debug, Clone)]
pub struct RumqttTransport {
    settings: RumqttSettings,
}

impl RumqttTransport {
    /// Create a transport with the given settings.
    #[must_use]
    pub fn new(settings: RumqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, client_id: &ClientId) -> MqttOptions {
        let s = &self.settings;
        let mut options = MqttOptions::new(client_id.as_str(), s.host.clone(), s.port);
        options
            .set_keep_alive(s.keep_alive)
            .set_clean_session(s.clean_session);
        if let Some(username) = &s.username {
            options.set_credentials(username.clone(), s.password.clone().unwrap_or_default());
        }
        options
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, client_id: &ClientId) -> Result<Box<dyn Connection>, TransportError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(client_id), self.settings.capacity);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(
                        client_id = %client_id,
                        session_present = ack.session_present,
                        "Broker accepted session"
                    );
                    break;
                }
                Ok(event) => trace!(?event, "Event before CONNACK"),
                Err(e) => return Err(TransportError::ConnectFailed(e.to_string())),
            }
        }

        Ok(Box::new(RumqttConnection {
            client: Arc::new(RumqttClient { client }),
            eventloop,
            drain_timeout: self.settings.drain_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

struct RumqttConnection {
    client: Arc<RumqttClient>,
    eventloop: EventLoop,
    drain_timeout: Duration,
}

#[async_trait]
impl Connection for RumqttConnection {
    fn client(&self) -> Arc<dyn BrokerClient> {
        Arc::clone(&self.client) as Arc<dyn BrokerClient>
    }

    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(Inbound::new(publish.topic, publish.payload)));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    for code in &ack.return_codes {
                        if matches!(code, SubscribeReasonCode::Failure) {
                            warn!(pkid = ack.pkid, "Broker rejected subscription");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                Ok(event) => trace!(?event, "MQTT event"),
                Err(e) => return Err(TransportError::ConnectionLost(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.client
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("Timed out draining broker session");
        }
        Ok(())
    }
}

struct RumqttClient {
    client: AsyncClient,
}

fn qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

#[async_trait]
impl BrokerClient for RumqttClient {
    async fn subscribe(&self, topic: &str, q: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, qos(q))
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Bytes, q: QoS) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, qos(q), false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}
