//! HTTP client for the remote reading collector.
//!
//! This module performs single HTTP exchanges with the collector: posting
//! one reading and listing recent readings. Retry and backoff live in
//! [`crate::uplink`], which drives any [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::reading::LoggedReading;

/// JSON body of `POST /api/data`.
///
/// `sequence_id` and `log_id` together identify the reading uniquely, so
/// the collector can discard duplicates produced by at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingPayload {
    /// ISO-8601 UTC arrival time
    pub timestamp: String,

    /// Measured pH value
    pub ph: f64,

    /// Shared secret expected by the collector
    pub api_key: String,

    /// Local log sequence id
    pub sequence_id: u64,

    /// Local log instance id
    pub log_id: Uuid,
}

impl ReadingPayload {
    pub fn new(logged: &LoggedReading, api_key: &str, log_id: Uuid) -> Self {
        Self {
            timestamp: logged.reading.timestamp_iso(),
            ph: logged.reading.ph_value,
            api_key: api_key.to_string(),
            sequence_id: logged.sequence_id,
            log_id,
        }
    }
}

/// Response from the ingestion endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IngestResponse {
    /// Status message from the API
    pub status: String,

    /// Row id assigned by the collector
    #[serde(default)]
    pub id: Option<i64>,

    /// Optional error message
    #[serde(default)]
    pub error: Option<String>,
}

impl IngestResponse {
    /// A 2xx answer whose body could not be read.
    fn unparsed(detail: String) -> Self {
        Self {
            status: "unknown".to_string(),
            id: None,
            error: Some(detail),
        }
    }
}

/// One entry of `GET /api/readings`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteReading {
    pub timestamp: String,
    pub ph: f64,
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an error status code
    Status {
        code: StatusCode,
        message: String,
    },

    /// Failed to parse response body
    Parse(String),

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Status { code, message } => {
                write!(f, "Server error ({}): {}", code, message)
            }
            ClientError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// A single-exchange connection to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post one reading. Non-2xx answers come back as `ClientError::Status`.
    async fn post_reading(&self, payload: &ReadingPayload) -> Result<IngestResponse, ClientError>;

    /// List up to `limit` readings stored by the collector.
    async fn fetch_readings(&self, limit: usize) -> Result<Vec<RemoteReading>, ClientError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post_reading(&self, payload: &ReadingPayload) -> Result<IngestResponse, ClientError> {
        (**self).post_reading(payload).await
    }

    async fn fetch_readings(&self, limit: usize) -> Result<Vec<RemoteReading>, ClientError> {
        (**self).fetch_readings(limit).await
    }
}

/// HTTP client for the collector API.
///
/// The underlying `reqwest::Client` is created once and reused, so
/// connections are pooled across deliveries.
pub struct CollectorClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL for the reading ingestion endpoint
    ingest_url: String,

    /// URL for the reading listing endpoint
    readings_url: String,

    /// Request timeout duration
    timeout: Duration,
}

impl CollectorClient {
    /// Create a new collector client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.ingest_url.clone(),
            config.readings_url.clone(),
            config.request_timeout,
        )
    }

    /// Create a new collector client with custom settings.
    pub fn with_settings(
        ingest_url: impl Into<String>,
        readings_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            ingest_url: ingest_url.into(),
            readings_url: readings_url.into(),
            timeout,
        })
    }

    /// Get the configured ingest URL.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Get the configured listing URL.
    pub fn readings_url(&self) -> &str {
        &self.readings_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for CollectorClient {
    async fn post_reading(&self, payload: &ReadingPayload) -> Result<IngestResponse, ClientError> {
        debug!(
            sequence_id = payload.sequence_id,
            url = %self.ingest_url,
            "Posting reading"
        );

        let response = self
            .client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            // The status line already confirms the collector stored the row.
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        sequence_id = payload.sequence_id,
                        error = %e,
                        "Collector accepted reading but the response body was cut off"
                    );
                    return Ok(IngestResponse::unparsed(e.to_string()));
                }
            };
            Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
                warn!(
                    sequence_id = payload.sequence_id,
                    error = %e,
                    "Collector accepted reading with an unexpected response body"
                );
                IngestResponse::unparsed(e.to_string())
            }))
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }

    async fn fetch_readings(&self, limit: usize) -> Result<Vec<RemoteReading>, ClientError> {
        let response = self
            .client
            .get(&self.readings_url)
            .timeout(self.timeout)
            .query(&[("limit", limit)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Status {
                code: status,
                message: body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ClientError::Parse(e.to_string()))
    }
}
