//! Serial device access.
//!
//! The ingestion loop only sees the [`DeviceConnector`] and [`LineSource`]
//! traits; [`SerialConnector`] is the production implementation on top of
//! `tokio-serial`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

/// Longest partial line kept across read windows.
const MAX_LINE_BYTES: usize = 4096;

/// Errors raised by the serial device.
#[derive(Debug)]
pub enum DeviceError {
    /// The device could not be opened
    Open { port: String, message: String },

    /// A read failed
    Read(std::io::Error),

    /// The device went away (end of stream)
    Disconnected,
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Open { port, message } => {
                write!(f, "Failed to open serial port {}: {}", port, message)
            }
            DeviceError::Read(e) => write!(f, "Serial read failed: {}", e),
            DeviceError::Disconnected => write!(f, "Serial device disconnected"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Read(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Read(err)
    }
}

/// A connected device producing text lines.
#[async_trait]
pub trait LineSource: Send {
    /// Wait for the next line.
    ///
    /// Returns `Ok(None)` when the read window elapsed without a complete
    /// line; that is not an error.
    async fn read_line(&mut self) -> Result<Option<String>, DeviceError>;
}

/// Opens a device on demand; called again after every fault.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    type Source: LineSource;

    async fn connect(&self) -> Result<Self::Source, DeviceError>;

    /// Human-readable device name for log output.
    fn describe(&self) -> String;
}

/// Splits a byte stream into lines with a bounded read window.
///
/// Bytes of an incomplete line survive a window timeout and are completed
/// by the next call.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(128),
            read_timeout,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LineSource for LineReader<R> {
    async fn read_line(&mut self) -> Result<Option<String>, DeviceError> {
        let outcome =
            tokio::time::timeout(self.read_timeout, self.reader.read_until(b'\n', &mut self.buf))
                .await;

        match outcome {
            Err(_) => {
                if self.buf.len() > MAX_LINE_BYTES {
                    warn!(
                        bytes = self.buf.len(),
                        "Discarding overlong partial line from device"
                    );
                    self.buf.clear();
                }
                Ok(None)
            }
            Ok(Ok(0)) => Err(DeviceError::Disconnected),
            Ok(Ok(_)) if self.buf.last() != Some(&b'\n') => {
                // Stream ended in the middle of a line.
                self.buf.clear();
                Err(DeviceError::Disconnected)
            }
            Ok(Ok(_)) => {
                // The device may send non-UTF-8 noise while booting.
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Ok(Some(line))
            }
            Ok(Err(e)) => Err(DeviceError::Read(e)),
        }
    }
}

/// Connector for a physical serial port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout,
        }
    }
}

#[async_trait]
impl DeviceConnector for SerialConnector {
    type Source = LineReader<SerialStream>;

    async fn connect(&self) -> Result<Self::Source, DeviceError> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .map_err(|e| DeviceError::Open {
                port: self.port.clone(),
                message: e.to_string(),
            })?;

        info!(
            port = %self.port,
            baud_rate = self.baud_rate,
            "Serial port opened"
        );

        Ok(LineReader::new(stream, self.read_timeout))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }
}
