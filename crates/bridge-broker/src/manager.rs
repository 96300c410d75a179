//! Broker connection manager.
//!
//! Owns the broker session for the life of the process: connects with a
//! fresh client identity, subscribes to every configured topic, forwards
//! inbound messages, and reconnects on a fixed interval whenever the
//! session drops. Only an explicit shutdown ends the loop.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected ─▶ Offline ─▶ Reconnecting ─▶ Connected
//!                                   │
//!                                   └─ shutdown ─▶ Disconnected
//! ```

use crate::traits::{BrokerClient, ClientId, Connection, Inbound, QoS, Transport, TransportError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped by shutdown.
    Disconnected,
    /// First connect attempt in progress.
    Connecting,
    /// Session established and subscribed.
    Connected,
    /// Session lost; waiting before the next attempt.
    Offline,
    /// Retry in progress.
    Reconnecting,
}

impl ConnectionState {
    /// State name, for logs and health output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Offline => "offline",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the connection manager, in the order things happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    State(ConnectionState),
    Message(Inbound),
}

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Prefix of the per-attempt client identity.
    pub client_id_prefix: String,
    /// Topics subscribed after every successful connect.
    pub subscriptions: Vec<String>,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "iot_web_client".to_string(),
            subscriptions: Vec::new(),
            connect_timeout: Duration::from_secs(4),
            reconnect_interval: Duration::from_secs(1),
            subscribe_qos: QoS::AtMostOnce,
            publish_qos: QoS::AtMostOnce,
            event_capacity: 1024,
        }
    }
}

type ClientSlot = Arc<RwLock<Option<Arc<dyn BrokerClient>>>>;

/// Handle to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct BrokerHandle {
    state: watch::Receiver<ConnectionState>,
    client: ClientSlot,
    shutdown: CancellationToken,
    publish_qos: QoS,
}

impl BrokerHandle {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Publish on the live session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] while no session is up;
    /// nothing is queued for later.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        client.publish(topic, payload, self.publish_qos).await
    }

    /// Ask the manager to disconnect and stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Reconnecting broker session owner.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    events: mpsc::Sender<BrokerEvent>,
    state: watch::Sender<ConnectionState>,
    client: ClientSlot,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager, its handle, and the receiver of its events.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
    ) -> (Self, BrokerHandle, mpsc::Receiver<BrokerEvent>) {
        let (events, rx) = mpsc::channel(config.event_capacity.max(1));
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let client: ClientSlot = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();

        let handle = BrokerHandle {
            state: state_rx,
            client: Arc::clone(&client),
            shutdown: shutdown.clone(),
            publish_qos: config.publish_qos,
        };
        let manager = Self {
            transport,
            config,
            events,
            state,
            client,
            shutdown,
        };
        (manager, handle, rx)
    }

    /// Run until shutdown is requested.
    pub async fn run(self) {
        let mut next = ConnectionState::Connecting;

        loop {
            self.set_state(next).await;
            next = ConnectionState::Reconnecting;

            let client_id = ClientId::generate(&self.config.client_id_prefix);
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&client_id),
                ) => attempt,
            };

            match attempt {
                Ok(Ok(mut conn)) => {
                    info!(client_id = %client_id, transport = self.transport.name(), "Connected to broker");
                    let end = self.serve(conn.as_mut()).await;
                    *self.client.write().await = None;

                    if let SessionEnd::Shutdown = end {
                        if let Err(e) = conn.close().await {
                            warn!(error = %e, "Error closing broker session");
                        }
                        break;
                    }
                    self.set_state(ConnectionState::Offline).await;
                }
                Ok(Err(e)) => warn!(client_id = %client_id, error = %e, "Broker connect failed"),
                Err(_) => warn!(
                    client_id = %client_id,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Broker connect timed out"
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!("Broker connection manager stopped");
    }

    /// Subscribe, publish the session, and forward messages until it ends.
    async fn serve(&self, conn: &mut dyn Connection) -> SessionEnd {
        let client = conn.client();

        // Subscribe requests only leave the client while the connection is
        // polled, so keep receiving until every request is queued.
        let mut early = Vec::new();
        {
            let subscribing = async {
                for topic in &self.config.subscriptions {
                    match client.subscribe(topic, self.config.subscribe_qos).await {
                        Ok(()) => debug!(topic = %topic, "Subscribed"),
                        Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
                    }
                }
            };
            tokio::pin!(subscribing);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut subscribing => break,
                    _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                    received = conn.recv() => match received {
                        Ok(Some(message)) => early.push(message),
                        Ok(None) => {
                            warn!("Broker closed the session while subscribing");
                            return SessionEnd::Lost;
                        }
                        Err(e) => {
                            warn!(error = %e, "Broker connection lost while subscribing");
                            return SessionEnd::Lost;
                        }
                    },
                }
            }
        }

        *self.client.write().await = Some(client);
        self.set_state(ConnectionState::Connected).await;

        for message in early {
            if self.events.send(BrokerEvent::Message(message)).await.is_err() {
                debug!("Event receiver dropped, stopping");
                self.shutdown.cancel();
                return SessionEnd::Shutdown;
            }
        }

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                received = conn.recv() => received,
            };
            match received {
                Ok(Some(message)) => {
                    if self.events.send(BrokerEvent::Message(message)).await.is_err() {
                        debug!("Event receiver dropped, stopping");
                        self.shutdown.cancel();
                        return SessionEnd::Shutdown;
                    }
                }
                Ok(None) => {
                    warn!("Broker closed the session");
                    return SessionEnd::Lost;
                }
                Err(e) => {
                    warn!(error = %e, "Broker connection lost");
                    return SessionEnd::Lost;
                }
            }
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        debug!(state = %state, "Broker connection state");
        // The receiver may already be gone during shutdown.
        let _ = self.events.send(BrokerEvent::State(state)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    enum Attempt {
        Fail,
        Hang,
        Session(Vec<Step>),
    }

    enum Step {
        Message(&'static str, &'static str),
        Drop,
    }

    #[derive(Default)]
    struct Log {
        entries: Mutex<Vec<String>>,
        connects: Mutex<Vec<(String, Instant)>>,
    }

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.entries.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    struct MockTransport {
        script: Mutex<VecDeque<Attempt>>,
        log: Arc<Log>,
    }

    impl MockTransport {
        fn new(script: Vec<Attempt>) -> (Arc<Self>, Arc<Log>) {
            let log = Arc::new(Log::default());
            let transport = Arc::new(Self {
                script: Mutex::new(script.into()),
                log: Arc::clone(&log),
            });
            (transport, log)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, client_id: &ClientId) -> Result<Box<dyn Connection>, TransportError> {
            self.log.push("connect");
            self.log
                .connects
                .lock()
                .unwrap()
                .push((client_id.to_string(), Instant::now()));

            let attempt = self.script.lock().unwrap().pop_front();
            match attempt {
                Some(Attempt::Session(steps)) => Ok(Box::new(MockConnection {
                    steps: steps.into(),
                    log: Arc::clone(&self.log),
                })),
                Some(Attempt::Hang) => std::future::pending().await,
                Some(Attempt::Fail) | None => {
                    Err(TransportError::ConnectFailed("refused".to_string()))
                }
            }
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    struct MockConnection {
        steps: VecDeque<Step>,
        log: Arc<Log>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn client(&self) -> Arc<dyn BrokerClient> {
            Arc::new(MockClient {
                log: Arc::clone(&self.log),
            })
        }

        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            self.log.push("recv");
            match self.steps.pop_front() {
                Some(Step::Message(topic, payload)) => Ok(Some(Inbound::new(topic, payload))),
                Some(Step::Drop) => Err(TransportError::ConnectionLost("reset".to_string())),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.log.push("close");
            Ok(())
        }
    }

    struct MockClient {
        log: Arc<Log>,
    }

    #[async_trait]
    impl BrokerClient for MockClient {
        async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
            self.log.push(format!("subscribe {topic}"));
            if topic.contains("broken") {
                return Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: "denied".to_string(),
                });
            }
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
            self.log
                .push(format!("publish {topic} {}", String::from_utf8_lossy(&payload)));
            Ok(())
        }
    }

    const TOPICS: [&str; 4] = [
        "iot/sensors/data",
        "iot/led/light/status",
        "iot/led/fan/status",
        "iot/led/ac/status",
    ];

    fn config() -> ManagerConfig {
        ManagerConfig {
            subscriptions: TOPICS.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn next_events(rx: &mut mpsc::Receiver<BrokerEvent>, n: usize) -> Vec<BrokerEvent> {
        let mut events = Vec::with_capacity(n);
        for _ in 0..n {
            events.push(rx.recv().await.unwrap());
        }
        events
    }

    fn message(topic: &str, payload: &'static str) -> BrokerEvent {
        BrokerEvent::Message(Inbound::new(topic, Bytes::from_static(payload.as_bytes())))
    }

    fn session_log() -> Vec<String> {
        let mut log = vec!["connect".to_string()];
        log.extend(TOPICS.iter().map(|t| format!("subscribe {t}")));
        log
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_before_delivery() {
        let (transport, log) = MockTransport::new(vec![
            Attempt::Session(vec![Step::Message("iot/led/fan/status", "on"), Step::Drop]),
            Attempt::Session(vec![Step::Message("iot/led/fan/status", "off")]),
        ]);
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config());
        let task = tokio::spawn(manager.run());

        let events = next_events(&mut rx, 7).await;
        assert_eq!(
            events,
            vec![
                BrokerEvent::State(ConnectionState::Connecting),
                BrokerEvent::State(ConnectionState::Connected),
                message("iot/led/fan/status", "on"),
                BrokerEvent::State(ConnectionState::Offline),
                BrokerEvent::State(ConnectionState::Reconnecting),
                BrokerEvent::State(ConnectionState::Connected),
                message("iot/led/fan/status", "off"),
            ]
        );

        let mut expected = session_log();
        expected.extend(["recv".to_string(), "recv".to_string()]);
        expected.extend(session_log());
        expected.push("recv".to_string());
        assert_eq!(log.entries()[..expected.len()], expected[..]);

        let connects = log.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 2);
        assert_ne!(connects[0].0, connects[1].0);
        assert!(connects[0].0.starts_with("iot_web_client_"));

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::State(ConnectionState::Disconnected))
        );
        assert_eq!(log.entries().last().map(String::as_str), Some("close"));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_retry_at_fixed_interval() {
        let (transport, log) = MockTransport::new(vec![
            Attempt::Fail,
            Attempt::Fail,
            Attempt::Session(vec![Step::Message("iot/sensors/data", "{}")]),
        ]);
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config());
        tokio::spawn(manager.run());

        let events = next_events(&mut rx, 5).await;
        assert_eq!(
            events,
            vec![
                BrokerEvent::State(ConnectionState::Connecting),
                BrokerEvent::State(ConnectionState::Reconnecting),
                BrokerEvent::State(ConnectionState::Reconnecting),
                BrokerEvent::State(ConnectionState::Connected),
                message("iot/sensors/data", "{}"),
            ]
        );

        let connects = log.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 3);
        for pair in connects.windows(2) {
            assert_eq!(pair[1].1 - pair[0].1, Duration::from_secs(1));
        }
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let (transport, log) = MockTransport::new(vec![
            Attempt::Hang,
            Attempt::Session(Vec::new()),
        ]);
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config());
        tokio::spawn(manager.run());

        let events = next_events(&mut rx, 3).await;
        assert_eq!(events[2], BrokerEvent::State(ConnectionState::Connected));

        let connects = log.connects.lock().unwrap().clone();
        // Connect timeout plus the reconnect interval.
        assert_eq!(connects[1].1 - connects[0].1, Duration::from_secs(5));
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_does_not_abort_others() {
        let (transport, log) = MockTransport::new(vec![Attempt::Session(vec![Step::Message(
            "iot/sensors/data",
            "{}",
        )])]);
        let mut config = config();
        config.subscriptions.insert(1, "iot/broken".to_string());
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config);
        tokio::spawn(manager.run());

        let events = next_events(&mut rx, 3).await;
        assert_eq!(events[1], BrokerEvent::State(ConnectionState::Connected));
        assert!(matches!(events[2], BrokerEvent::Message(_)));

        let subscribes = log
            .entries()
            .iter()
            .filter(|e| e.starts_with("subscribe"))
            .count();
        assert_eq!(subscribes, 5);
        handle.shutdown();
    }

    /// Client whose requests sit in a bounded queue drained only by `recv`,
    /// like rumqttc's request channel and event loop.
    struct QueuedTransport {
        capacity: usize,
        expected: usize,
        acked: Arc<Mutex<Vec<String>>>,
    }

    struct QueuedConnection {
        client: Arc<QueuedClient>,
        requests: mpsc::Receiver<String>,
        expected: usize,
        acked: Arc<Mutex<Vec<String>>>,
        pending: Option<Inbound>,
    }

    struct QueuedClient {
        requests: mpsc::Sender<String>,
    }

    #[async_trait]
    impl Transport for QueuedTransport {
        async fn connect(&self, _client_id: &ClientId) -> Result<Box<dyn Connection>, TransportError> {
            let (tx, rx) = mpsc::channel(self.capacity);
            Ok(Box::new(QueuedConnection {
                client: Arc::new(QueuedClient { requests: tx }),
                requests: rx,
                expected: self.expected,
                acked: Arc::clone(&self.acked),
                pending: Some(Inbound::new("iot/led/fan/status", Bytes::from_static(b"on"))),
            }))
        }

        fn name(&self) -> &'static str {
            "queued"
        }
    }

    #[async_trait]
    impl Connection for QueuedConnection {
        fn client(&self) -> Arc<dyn BrokerClient> {
            Arc::clone(&self.client) as Arc<dyn BrokerClient>
        }

        async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
            loop {
                if self.acked.lock().unwrap().len() >= self.expected {
                    if let Some(message) = self.pending.take() {
                        return Ok(Some(message));
                    }
                    return std::future::pending().await;
                }
                match self.requests.recv().await {
                    Some(topic) => self.acked.lock().unwrap().push(topic),
                    None => return Ok(None),
                }
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerClient for QueuedClient {
        async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
            self.requests
                .send(topic.to_string())
                .await
                .map_err(|e| TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        }

        async fn publish(&self, _topic: &str, _payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_more_topics_than_request_capacity() {
        let topics: Vec<String> = (0..6).map(|i| format!("site/device{i}/status")).collect();
        let acked = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(QueuedTransport {
            capacity: 2,
            expected: topics.len(),
            acked: Arc::clone(&acked),
        });
        let config = ManagerConfig {
            subscriptions: topics.clone(),
            ..Default::default()
        };
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config);
        tokio::spawn(manager.run());

        let events = tokio::time::timeout(Duration::from_secs(30), next_events(&mut rx, 3))
            .await
            .expect("subscribing stalled on a full request queue");
        assert_eq!(
            events,
            vec![
                BrokerEvent::State(ConnectionState::Connecting),
                BrokerEvent::State(ConnectionState::Connected),
                message("iot/led/fan/status", "on"),
            ]
        );
        assert_eq!(*acked.lock().unwrap(), topics);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_live_session() {
        let (transport, log) = MockTransport::new(vec![Attempt::Session(Vec::new())]);
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config());

        assert_eq!(
            handle.publish("iot/led/fan/command", Bytes::from_static(b"on")).await,
            Err(TransportError::NotConnected)
        );

        let task = tokio::spawn(manager.run());
        next_events(&mut rx, 2).await;
        assert_eq!(handle.state(), ConnectionState::Connected);
        handle
            .publish("iot/led/fan/command", Bytes::from_static(b"on"))
            .await
            .unwrap();
        assert!(log
            .entries()
            .contains(&"publish iot/led/fan/command on".to_string()));

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(
            handle.publish("iot/led/fan/command", Bytes::from_static(b"off")).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_retrying() {
        let (transport, _log) = MockTransport::new(Vec::new());
        let (manager, handle, mut rx) = ConnectionManager::new(transport, config());
        let task = tokio::spawn(manager.run());

        next_events(&mut rx, 2).await;
        handle.shutdown();
        task.await.unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(BrokerEvent::State(ConnectionState::Disconnected)));
    }
}
