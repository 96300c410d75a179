//! Intake loop and broker wiring.
//!
//! Broker events and viewer connect/disconnect requests are applied to the
//! bridge from a single task, so a newcomer's initial pushes never
//! interleave with a broadcast.

use crate::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use iot_bridge_broker::{BrokerEvent, BrokerHandle, ConnectionState};
use iot_bridge_core::{Bridge, ClientSession, CommandPublisher, IngestOutcome, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Viewer lifecycle requests for the intake loop.
#[derive(Debug)]
pub enum ClientIntake {
    Connect(ClientSession),
    Disconnect(SessionId),
}

/// Publishes viewer commands on the live broker session.
#[derive(Debug, Clone)]
pub struct BrokerPublisher(pub BrokerHandle);

#[async_trait]
impl CommandPublisher for BrokerPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), String> {
        self.0.publish(topic, payload).await.map_err(|e| e.to_string())
    }
}

/// Apply broker events and viewer requests to the bridge until both
/// sources are closed.
pub async fn run_intake(
    bridge: Arc<Bridge>,
    mut broker: mpsc::Receiver<BrokerEvent>,
    mut clients: mpsc::UnboundedReceiver<ClientIntake>,
) {
    let mut broker_open = true;
    let mut clients_open = true;

    while broker_open || clients_open {
        tokio::select! {
            event = broker.recv(), if broker_open => match event {
                Some(BrokerEvent::Message(message)) => {
                    let outcome = bridge
                        .handle_broker_message(&message.topic, &message.payload)
                        .await;
                    metrics::record_broker_message(&outcome);
                    if let IngestOutcome::Rejected(_) = outcome {
                        metrics::record_error("parse");
                    }
                }
                Some(BrokerEvent::State(state)) => on_broker_state(state),
                None => {
                    debug!("Broker event stream closed");
                    broker_open = false;
                }
            },
            request = clients.recv(), if clients_open => match request {
                Some(ClientIntake::Connect(session)) => bridge.connect_client(session),
                Some(ClientIntake::Disconnect(id)) => {
                    bridge.disconnect_client(&id);
                }
                None => clients_open = false,
            },
        }
    }

    debug!("Intake loop stopped");
}

fn on_broker_state(state: ConnectionState) {
    metrics::set_broker_state(state);
    match state {
        ConnectionState::Connected => info!("Broker connected"),
        ConnectionState::Offline => {
            metrics::record_error("broker");
            warn!("Broker offline, messages are not delivered until reconnect");
        }
        other => debug!(state = %other, "Broker state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iot_bridge_broker::Inbound;
    use iot_bridge_core::{BridgeConfig, DeviceTable, MemoryGateway};
    use iot_bridge_protocol::ServerEvent;

    struct NullPublisher;

    #[async_trait]
    impl CommandPublisher for NullPublisher {
        async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), String> {
            Ok(())
        }
    }

    fn bridge() -> Arc<Bridge> {
        let (bridge, worker) = Bridge::new(
            DeviceTable::default(),
            BridgeConfig::default(),
            Arc::new(MemoryGateway::new()),
            Arc::new(NullPublisher),
        )
        .unwrap();
        tokio::spawn(worker.run());
        Arc::new(bridge)
    }

    #[tokio::test]
    async fn test_intake_orders_connect_with_broadcasts() {
        let bridge = bridge();
        let (broker_tx, broker_rx) = mpsc::channel(16);
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let intake = tokio::spawn(run_intake(Arc::clone(&bridge), broker_rx, client_rx));

        broker_tx
            .send(BrokerEvent::Message(Inbound::new(
                "iot/led/fan/status",
                Bytes::from_static(b"on"),
            )))
            .await
            .unwrap();
        while !bridge.snapshot()["fan"] {
            tokio::task::yield_now().await;
        }

        let (session, mut rx) = ClientSession::channel();
        let id = session.id.clone();
        client_tx.send(ClientIntake::Connect(session)).unwrap();

        // Initial snapshot already reflects the earlier status.
        match rx.recv().await.as_deref() {
            Some(ServerEvent::DeviceStates(states)) => assert!(states["fan"]),
            other => panic!("unexpected event {:?}", other),
        }

        broker_tx
            .send(BrokerEvent::Message(Inbound::new(
                "iot/led/fan/status",
                Bytes::from_static(b"off"),
            )))
            .await
            .unwrap();
        match rx.recv().await.as_deref() {
            Some(ServerEvent::DeviceStatus(status)) => assert_eq!(status.status, "off"),
            other => panic!("unexpected event {:?}", other),
        }

        client_tx.send(ClientIntake::Disconnect(id)).unwrap();
        drop(broker_tx);
        drop(client_tx);
        intake.await.unwrap();
        assert!(bridge.registry().is_empty());
    }
}
