//! Connection handlers for the bridge server.
//!
//! This module wires the bridge together and handles the viewer
//! connection lifecycle and event processing.

use crate::config::{Config, PersistenceBackend, PersistenceConfig};
use crate::metrics::{self, ClientMetricsGuard};
use crate::service::{self, BrokerPublisher, ClientIntake};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use iot_bridge_broker::{ConnectionManager, ConnectionState, RumqttTransport};
use iot_bridge_core::{
    Bridge, ClientSession, MemoryGateway, PersistenceGateway, RelayError, SessionId, TopicRouter,
};
use iot_bridge_protocol::{codec, ClientEvent, ProtocolError, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for queued broker messages to be applied.
const INTAKE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared server state.
pub struct AppState {
    /// The bridge.
    pub bridge: Arc<Bridge>,
    /// Viewer lifecycle requests for the intake loop.
    pub intake: mpsc::UnboundedSender<ClientIntake>,
    /// Broker connection state.
    pub broker_state: watch::Receiver<ConnectionState>,
    /// Server configuration.
    pub config: Config,
}

/// Reply encoding of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Text,
    Binary,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Open the configured history store.
///
/// A store that cannot be reached is logged and replaced by the in-memory
/// one; the bridge keeps serving live data either way.
async fn open_gateway(config: &PersistenceConfig) -> Result<Arc<dyn PersistenceGateway>> {
    match config.backend {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryGateway::new())),
        #[cfg(feature = "mysql")]
        PersistenceBackend::Mysql => {
            use iot_bridge_core::gateway::{MySqlGateway, MySqlSettings};

            let url = config
                .url
                .as_deref()
                .context("persistence.url is required for the mysql backend")?;
            match MySqlGateway::connect(&MySqlSettings::new(url)).await {
                Ok(gateway) => Ok(Arc::new(gateway)),
                Err(e) => {
                    error!(error = %e, "History store unavailable, keeping history in memory");
                    metrics::record_error("persistence");
                    Ok(Arc::new(MemoryGateway::new()))
                }
            }
        }
        #[cfg(not(feature = "mysql"))]
        PersistenceBackend::Mysql => {
            anyhow::bail!("the mysql backend requires building with the `mysql` feature")
        }
    }
}

/// Run the bridge until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let devices = config.device_table()?;
    let subscriptions = TopicRouter::new(config.broker.telemetry_topic.clone(), &devices)
        .context("Invalid topic configuration")?
        .subscriptions()
        .to_vec();
    let gateway = open_gateway(&config.persistence).await?;

    let transport = Arc::new(RumqttTransport::new(config.broker.rumqtt_settings()));
    let (manager, broker, broker_events) =
        ConnectionManager::new(transport, config.broker.manager_config(subscriptions));

    let (bridge, worker) = Bridge::new(
        devices,
        config.bridge_config(),
        gateway,
        Arc::new(BrokerPublisher(broker.clone())),
    )?;
    let bridge = Arc::new(bridge);
    tokio::spawn(worker.run());
    bridge.bootstrap().await;

    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let intake_task = tokio::spawn(service::run_intake(
        Arc::clone(&bridge),
        broker_events,
        intake_rx,
    ));
    let manager_task = tokio::spawn(manager.run());

    let state = Arc::new(AppState {
        bridge: Arc::clone(&bridge),
        intake: intake_tx,
        broker_state: broker.watch_state(),
        config: config.clone(),
    });
    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Bridge listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    info!(
        "Broker: {}:{} ({} devices)",
        config.broker.host,
        config.broker.port,
        bridge.devices().len()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    broker.shutdown();
    if let Err(e) = manager_task.await {
        error!(error = %e, "Broker connection manager failed");
    }
    if tokio::time::timeout(INTAKE_DRAIN_TIMEOUT, intake_task)
        .await
        .is_err()
    {
        debug!("Viewer sessions still open, not waiting for intake loop");
    }
    if !bridge.persistence().flush().await {
        warn!("Persistence worker stopped before flush");
    }
    info!(
        written = bridge.persistence().stats().written(),
        failed = bridge.persistence().stats().failed(),
        "History flushed"
    );

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = *state.broker_state.borrow();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker.as_str(),
        "clients": state.bridge.registry().len(),
        "devices": state.bridge.snapshot(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ClientMetricsGuard::new();

    let (session, mut outbound) = ClientSession::channel();
    let session_id = session.id.clone();

    debug!(connection = %session_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();
    let mut encoding = Encoding::Text;

    // Hello goes out before the initial pushes queued by the intake loop.
    let hello = ServerEvent::connected(session_id.as_str());
    if send_event(&mut sender, &hello, encoding).await.is_err() {
        error!(connection = %session_id, "Failed to send connected event");
        return;
    }
    if state.intake.send(ClientIntake::Connect(session)).is_err() {
        warn!(connection = %session_id, "Bridge is shutting down, closing session");
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut open = true;

    while open {
        tokio::select! {
            Some(event) = outbound.recv() => {
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match codec::decode_text(&text) {
                        Ok(event) => {
                            open = handle_client_event(event, &session_id, &state, &mut sender, encoding)
                                .await
                                .is_ok();
                        }
                        Err(e) => {
                            warn!(connection = %session_id, error = %e, "Ignoring undecodable text frame");
                            metrics::record_error("decode");
                        }
                    },
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::Binary;
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    if handle_client_event(event, &session_id, &state, &mut sender, encoding)
                                        .await
                                        .is_err()
                                    {
                                        open = false;
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(ProtocolError::FrameTooLarge(len)) => {
                                    warn!(connection = %session_id, len, "Binary frame too large, resetting buffer");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    break;
                                }
                                Err(e) => {
                                    // The bad frame is consumed; keep decoding the rest.
                                    warn!(connection = %session_id, error = %e, "Ignoring undecodable binary frame");
                                    metrics::record_error("decode");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: leave the registry
    let _ = state.intake.send(ClientIntake::Disconnect(session_id.clone()));

    debug!(connection = %session_id, "WebSocket disconnected");
}

/// Handle a decoded client event.
async fn handle_client_event(
    event: ClientEvent,
    session_id: &SessionId,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    encoding: Encoding,
) -> Result<()> {
    match event {
        ClientEvent::DeviceControl { device, action } => {
            debug!(connection = %session_id, device = %device, action = %action, "Device control request");

            match state.bridge.issue_command(&device, &action).await {
                Ok(()) => metrics::record_command("published"),
                Err(e) => {
                    let outcome = match e {
                        RelayError::UnknownDevice(_) | RelayError::EmptyAction => "rejected",
                        RelayError::Publish(_) => "failed",
                    };
                    metrics::record_command(outcome);
                    warn!(connection = %session_id, device = %device, error = %e, "Command not relayed");

                    let reply = ServerEvent::control_error(device, action, e.to_string());
                    send_event(sender, &reply, encoding).await?;
                }
            }
        }

        ClientEvent::Ping { timestamp } => {
            send_event(sender, &ServerEvent::pong(timestamp), encoding).await?;
        }
    }

    Ok(())
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
) -> Result<()> {
    let message = match encoding {
        Encoding::Text => Message::Text(codec::encode_text(event)?),
        Encoding::Binary => Message::Binary(codec::encode_binary(event)?.to_vec()),
    };
    sender.send(message).await?;
    metrics::record_event_sent();
    Ok(())
}
