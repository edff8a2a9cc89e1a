//! pH Telemetry Library
//!
//! This library provides the pieces of a pH sensor telemetry pipeline:
//!
//! - **config**: Environment-based configuration
//! - **reading**: Reading and delivery-state types
//! - **parser**: Serial line protocol parser
//! - **store**: Durable append-only reading log
//! - **device**: Serial device access behind connector traits
//! - **client**: HTTP client for the remote collector
//! - **uplink**: Delivery with retry, backoff and the uplink worker
//! - **ingest**: Ingestion loop state machine
//! - **supervisor**: Startup, resume and shutdown of the whole pipeline
//!
//! # Example
//!
//! ```no_run
//! use ph_telemetry::client::CollectorClient;
//! use ph_telemetry::config::Config;
//! use ph_telemetry::device::SerialConnector;
//! use ph_telemetry::supervisor::Pipeline;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let connector = SerialConnector::new(&config.serial_port, config.baud_rate, config.read_timeout);
//!     let client = CollectorClient::new(&config).expect("Failed to create client");
//!
//!     let summary = Pipeline::run(&config, connector, client, CancellationToken::new())
//!         .await
//!         .expect("Pipeline failed");
//!     println!("Delivered {} readings", summary.uplink.delivered);
//! }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod device;
pub mod ingest;
pub mod parser;
pub mod reading;
pub mod store;
pub mod supervisor;
pub mod uplink;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, CollectorClient, IngestResponse, ReadingPayload, Transport};
pub use config::{Config, ConfigError};
pub use device::{DeviceConnector, DeviceError, LineSource, SerialConnector};
pub use ingest::{IngestError, IngestLoop, IngestStats, LinkState};
pub use parser::{parse_line, ParseError, ParsedLine};
pub use reading::{DeliveryState, LoggedReading, Reading};
pub use store::{LogCounts, ReadingLog, StorageError};
pub use supervisor::{Pipeline, PipelineError, RunSummary};
pub use uplink::{DeliveryResult, RetryPolicy, Uplink, UplinkStats};
