//! Metrics collection and export for the bridge.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use iot_bridge_broker::ConnectionState;
use iot_bridge_core::IngestOutcome;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CLIENTS_TOTAL: &str = "bridge_clients_total";
    pub const CLIENTS_ACTIVE: &str = "bridge_clients_active";
    pub const BROKER_MESSAGES_TOTAL: &str = "bridge_broker_messages_total";
    pub const EVENTS_SENT_TOTAL: &str = "bridge_events_sent_total";
    pub const COMMANDS_TOTAL: &str = "bridge_commands_total";
    pub const BROKER_CONNECTED: &str = "bridge_broker_connected";
    pub const ERRORS_TOTAL: &str = "bridge_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CLIENTS_TOTAL,
        "Total number of viewer connections since start"
    );
    metrics::describe_gauge!(names::CLIENTS_ACTIVE, "Current number of connected viewers");
    metrics::describe_counter!(
        names::BROKER_MESSAGES_TOTAL,
        "Broker messages processed, by outcome"
    );
    metrics::describe_counter!(names::EVENTS_SENT_TOTAL, "Events written to viewers");
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Viewer commands, by outcome");
    metrics::describe_gauge!(
        names::BROKER_CONNECTED,
        "1 while the broker session is up, 0 otherwise"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new viewer.
pub fn record_client_connected() {
    counter!(names::CLIENTS_TOTAL).increment(1);
    gauge!(names::CLIENTS_ACTIVE).increment(1.0);
}

/// Record a viewer leaving.
pub fn record_client_disconnected() {
    gauge!(names::CLIENTS_ACTIVE).decrement(1.0);
}

/// Label for an ingest outcome.
#[must_use]
pub fn outcome_kind(outcome: &IngestOutcome) -> &'static str {
    match outcome {
        IngestOutcome::Telemetry { .. } => "telemetry",
        IngestOutcome::Status { .. } => "status",
        IngestOutcome::Rejected(_) => "rejected",
        IngestOutcome::Unrecognized => "unrecognized",
        IngestOutcome::Suppressed { .. } => "suppressed",
    }
}

/// Record a processed broker message.
pub fn record_broker_message(outcome: &IngestOutcome) {
    counter!(names::BROKER_MESSAGES_TOTAL, "kind" => outcome_kind(outcome)).increment(1);
}

/// Record an event written to a viewer.
pub fn record_event_sent() {
    counter!(names::EVENTS_SENT_TOTAL).increment(1);
}

/// Record a viewer command.
pub fn record_command(outcome: &'static str) {
    counter!(names::COMMANDS_TOTAL, "outcome" => outcome).increment(1);
}

/// Track the broker connection state.
pub fn set_broker_state(state: ConnectionState) {
    let up = if state == ConnectionState::Connected { 1.0 } else { 0.0 };
    gauge!(names::BROKER_CONNECTED).set(up);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records the viewer leaving on drop.
pub struct ClientMetricsGuard;

impl ClientMetricsGuard {
    /// Create a new metrics guard, recording a viewer.
    #[must_use]
    pub fn new() -> Self {
        record_client_connected();
        Self
    }
}

impl Default for ClientMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientMetricsGuard {
    fn drop(&mut self) {
        record_client_disconnected();
    }
}
