//! pH Telemetry - serial pH sensor to remote collector pipeline
//!
//! This service reads pH readings from a serial device, stores each one in a
//! durable local log, and delivers it to the remote collector over HTTP.
//! Readings that cannot be delivered stay in the log and are retried on the
//! next run.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `PH_TELEMETRY_API_KEY`: Shared secret for the collector (required)
//! - `PH_TELEMETRY_SERIAL_PORT`: Serial device (default: /dev/ttyACM0)
//! - `PH_TELEMETRY_BAUD_RATE`: Serial baud rate (default: 9600)
//! - `PH_TELEMETRY_API_URL`: Collector base URL (default: http://127.0.0.1:5000)
//! - `PH_TELEMETRY_LOG_PATH`: Durable reading log file (default: ph_readings.jsonl)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! See [`ph_telemetry::config`] for the full list.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ph_telemetry::client::CollectorClient;
use ph_telemetry::config::Config;
use ph_telemetry::device::SerialConnector;
use ph_telemetry::supervisor::Pipeline;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting pH telemetry service...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                serial_port = %config.serial_port,
                baud_rate = config.baud_rate,
                api_url = %config.api_url,
                log_path = %config.log_path.display(),
                max_attempts = config.retry.max_attempts(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Create HTTP client with connection pooling
    let client = match CollectorClient::new(&config) {
        Ok(client) => {
            info!(
                ingest_url = %client.ingest_url(),
                "HTTP client initialized"
            );
            client
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let connector =
        SerialConnector::new(&config.serial_port, config.baud_rate, config.read_timeout);

    // Ctrl+C cancels the pipeline; it then shuts down in order
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    info!("pH telemetry running. Press Ctrl+C to stop.");
    match Pipeline::run(&config, connector, client, shutdown).await {
        Ok(summary) => {
            info!(
                readings_accepted = summary.ingest.readings_accepted,
                delivered = summary.uplink.delivered,
                still_pending = summary.log.pending,
                "pH telemetry stopped"
            );
        }
        Err(e) => {
            error!(error = %e, "pH telemetry stopped with an error");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
