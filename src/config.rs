//! Configuration module for the pH telemetry uplink.
//!
//! All settings come from environment variables with the `PH_TELEMETRY_`
//! prefix. Only the collector API key is required.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::uplink::RetryPolicy;

/// Default serial device path
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";

/// Default serial baud rate
const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default base URL of the remote collector
const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";

/// Default location of the durable reading log
const DEFAULT_LOG_PATH: &str = "ph_readings.jsonl";

/// Default serial read window in seconds
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;

/// Bounds for the serial read window
const MIN_READ_TIMEOUT_SECS: u64 = 1;
const MAX_READ_TIMEOUT_SECS: u64 = 300;

/// Time the device needs after open before it emits data (board reset)
const DEFAULT_SETTLE_DELAY_MS: u64 = 2000;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Default first retry delay in milliseconds
const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default maximum retry delay in milliseconds
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

/// Default delivery attempts per reading
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on delivery attempts per reading
const MAX_MAX_ATTEMPTS: u32 = 100;

/// Default wait before reopening a faulted device, in seconds
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 2;

/// Default grace period for in-flight deliveries at shutdown, in seconds
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Default capacity of the uplink work queue
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default interval between pending-record rescans, in seconds
const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 30;

/// Configuration for the telemetry pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device path or name
    pub serial_port: String,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Base URL of the remote collector
    pub api_url: String,

    /// Full URL of the reading ingestion endpoint
    pub ingest_url: String,

    /// Full URL of the reading listing endpoint
    pub readings_url: String,

    /// Shared secret sent with every reading
    pub api_key: String,

    /// Path of the durable reading log
    pub log_path: PathBuf,

    /// Serial read window; an empty window is not an error
    pub read_timeout: Duration,

    /// Wait after opening the device before reading
    pub settle_delay: Duration,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Backoff and attempt limits for delivery
    pub retry: RetryPolicy,

    /// Wait between device reconnect attempts
    pub reconnect_delay: Duration,

    /// Consecutive failed reconnects tolerated, `None` for unlimited
    pub max_reconnect_attempts: Option<u32>,

    /// Time allowed for in-flight deliveries at shutdown
    pub shutdown_grace: Duration,

    /// Capacity of the uplink work queue
    pub queue_capacity: usize,

    /// Interval between rescans of pending records
    pub rescan_interval: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `PH_TELEMETRY_API_KEY` is missing or empty
    /// - a numeric variable does not parse or is outside its bounds
    /// - the retry base delay exceeds the retry cap
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ph_telemetry::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector: {}", config.ingest_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let serial_port = env::var("PH_TELEMETRY_SERIAL_PORT")
            .unwrap_or_else(|_| DEFAULT_SERIAL_PORT.to_string());
        if serial_port.trim().is_empty() {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_SERIAL_PORT",
                "serial port must not be empty",
            ));
        }

        let baud_rate: u32 = parse_var("PH_TELEMETRY_BAUD_RATE", DEFAULT_BAUD_RATE)?;
        if baud_rate == 0 {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_BAUD_RATE",
                "baud rate must be greater than 0",
            ));
        }

        let api_url = env::var("PH_TELEMETRY_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let api_key = match env::var("PH_TELEMETRY_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            Ok(_) => {
                return Err(ConfigError::for_var(
                    "PH_TELEMETRY_API_KEY",
                    "API key must not be empty",
                ))
            }
            Err(_) => {
                return Err(ConfigError::for_var(
                    "PH_TELEMETRY_API_KEY",
                    "API key is required",
                ))
            }
        };

        let log_path = env::var("PH_TELEMETRY_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_PATH));

        let read_timeout_secs = parse_bounded(
            "PH_TELEMETRY_READ_TIMEOUT_SECS",
            DEFAULT_READ_TIMEOUT_SECS,
            MIN_READ_TIMEOUT_SECS,
            MAX_READ_TIMEOUT_SECS,
        )?;

        let settle_delay_ms: u64 =
            parse_var("PH_TELEMETRY_SETTLE_DELAY_MS", DEFAULT_SETTLE_DELAY_MS)?;
        let request_timeout_secs: u64 =
            parse_var("PH_TELEMETRY_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?;

        let retry = Self::parse_retry_policy()?;

        let reconnect_delay_secs: u64 =
            parse_var("PH_TELEMETRY_RECONNECT_DELAY_SECS", DEFAULT_RECONNECT_DELAY_SECS)?;
        let max_reconnect_attempts: u32 = parse_var("PH_TELEMETRY_MAX_RECONNECT_ATTEMPTS", 0)?;

        let shutdown_grace_secs: u64 =
            parse_var("PH_TELEMETRY_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)?;

        let queue_capacity: usize =
            parse_var("PH_TELEMETRY_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity == 0 {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_QUEUE_CAPACITY",
                "queue capacity must be greater than 0",
            ));
        }

        let rescan_interval_secs: u64 =
            parse_var("PH_TELEMETRY_RESCAN_INTERVAL_SECS", DEFAULT_RESCAN_INTERVAL_SECS)?;
        if rescan_interval_secs == 0 {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_RESCAN_INTERVAL_SECS",
                "rescan interval must be greater than 0",
            ));
        }

        Ok(Self {
            serial_port,
            baud_rate,
            ingest_url: format!("{}/api/data", api_url),
            readings_url: format!("{}/api/readings", api_url),
            api_url,
            api_key,
            log_path,
            read_timeout: Duration::from_secs(read_timeout_secs),
            settle_delay: Duration::from_millis(settle_delay_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            retry,
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            max_reconnect_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            queue_capacity,
            rescan_interval: Duration::from_secs(rescan_interval_secs),
        })
    }

    /// Parse the delivery retry policy with validation.
    fn parse_retry_policy() -> Result<RetryPolicy, ConfigError> {
        let base_ms: u64 = parse_var("PH_TELEMETRY_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?;
        if base_ms == 0 {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_RETRY_BASE_MS",
                "retry base delay must be greater than 0",
            ));
        }

        let cap_ms: u64 = parse_var("PH_TELEMETRY_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)?;
        if cap_ms < base_ms {
            return Err(ConfigError::for_var(
                "PH_TELEMETRY_RETRY_MAX_MS",
                format!("retry cap {}ms is below the base delay {}ms", cap_ms, base_ms),
            ));
        }

        let max_attempts = parse_bounded(
            "PH_TELEMETRY_MAX_ATTEMPTS",
            DEFAULT_MAX_ATTEMPTS,
            1,
            MAX_MAX_ATTEMPTS,
        )?;

        Ok(RetryPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(cap_ms),
            max_attempts,
        ))
    }
}

/// Read and parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| {
                ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
            }),
        Err(_) => Ok(default),
    }
}

/// Like [`parse_var`], rejecting values outside `min..=max`.
fn parse_bounded<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value = parse_var(env_var, default)?;

    if value < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }

    if value > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({})", value, max),
        ));
    }

    Ok(value)
}

impl Default for Config {
    /// Default configuration with a placeholder API key.
    ///
    /// This is useful for testing; production configuration always comes
    /// from [`Config::from_env`].
    fn default() -> Self {
        Self {
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            api_url: DEFAULT_API_URL.to_string(),
            ingest_url: format!("{}/api/data", DEFAULT_API_URL),
            readings_url: format!("{}/api/readings", DEFAULT_API_URL),
            api_key: "CHANGE_ME_TO_A_SECRET_KEY".to_string(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::new(
                Duration::from_millis(DEFAULT_RETRY_BASE_MS),
                Duration::from_millis(DEFAULT_RETRY_MAX_MS),
                DEFAULT_MAX_ATTEMPTS,
            ),
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            max_reconnect_attempts: None,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rescan_interval: Duration::from_secs(DEFAULT_RESCAN_INTERVAL_SECS),
        }
    }
}
