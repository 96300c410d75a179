//! # IoT Bridge
//!
//! Relays MQTT telemetry and device status to live WebSocket viewers and
//! viewer commands back to the devices.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! iot-bridge
//!
//! # Run with custom config
//! iot-bridge --config /path/to/iot-bridge.toml
//!
//! # Run with environment variables
//! BRIDGE_PORT=8080 BRIDGE_BROKER__HOST=mqtt.local iot-bridge
//! ```

mod config;
mod handlers;
mod metrics;
mod service;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// iot-bridge -- relay between an MQTT broker and live WebSocket viewers
#[derive(Debug, Parser)]
#[command(name = "iot-bridge", version, about = "Relay MQTT telemetry and device status to WebSocket viewers")]
struct Args {
    /// Config file (default: first of iot-bridge.toml, /etc/iot-bridge/, ~/.config/iot-bridge/)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "iot_bridge=debug,iot_bridge_core=debug,iot_bridge_broker=debug,info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting IoT bridge on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
