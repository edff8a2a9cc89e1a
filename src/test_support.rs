//! Scripted fakes for the transport and device seams.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::client::{ClientError, IngestResponse, ReadingPayload, RemoteReading, Transport};
use crate::device::{DeviceConnector, DeviceError, LineSource};
use crate::store::LogSink;

pub fn ok_response(id: i64) -> IngestResponse {
    IngestResponse {
        status: "ok".to_string(),
        id: Some(id),
        error: None,
    }
}

pub fn status_error(code: u16) -> ClientError {
    ClientError::Status {
        code: StatusCode::from_u16(code).unwrap(),
        message: format!("scripted {}", code),
    }
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Transport that replays a fixed list of outcomes.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<IngestResponse, ClientError>>>,
    ok_when_exhausted: bool,
    attempts: Mutex<Vec<Instant>>,
    posted: Mutex<Vec<ReadingPayload>>,
    listing_fails: bool,
}

impl ScriptedTransport {
    /// Replays `script`, then answers 500 forever.
    pub fn new(script: Vec<Result<IngestResponse, ClientError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ok_when_exhausted: false,
            attempts: Mutex::new(Vec::new()),
            posted: Mutex::new(Vec::new()),
            listing_fails: false,
        }
    }

    /// Accepts every reading.
    pub fn always_ok() -> Self {
        Self {
            ok_when_exhausted: true,
            ..Self::new(Vec::new())
        }
    }

    /// Make `fetch_readings` answer 503.
    pub fn with_failing_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Time between consecutive post attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        let attempts = self.attempts.lock().unwrap();
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn posted(&self) -> Vec<ReadingPayload> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_reading(&self, payload: &ReadingPayload) -> Result<IngestResponse, ClientError> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.posted.lock().unwrap().push(payload.clone());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => outcome,
            None if self.ok_when_exhausted => Ok(ok_response(payload.sequence_id as i64)),
            None => Err(status_error(500)),
        }
    }

    async fn fetch_readings(&self, limit: usize) -> Result<Vec<RemoteReading>, ClientError> {
        if self.listing_fails {
            return Err(status_error(503));
        }
        Ok(self
            .posted
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .map(|p| RemoteReading {
                timestamp: p.timestamp.clone(),
                ph: p.ph,
            })
            .collect())
    }
}

/// One step of a scripted device.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver this raw line
    Line(String),

    /// An empty read window
    Idle,

    /// A read fault
    Fail,
}

/// Device that plays back steps, then stays idle.
pub struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the source has been dropped.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LineSource for ScriptedSource {
    async fn read_line(&mut self) -> Result<Option<String>, DeviceError> {
        match self.steps.pop_front() {
            Some(ScriptStep::Line(line)) => Ok(Some(line)),
            Some(ScriptStep::Fail) => Err(DeviceError::Read(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted fault",
            ))),
            Some(ScriptStep::Idle) | None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(None)
            }
        }
    }
}

/// Connector that hands out scripted sources in order, then fails to open.
pub struct ScriptedConnector {
    opens: Mutex<VecDeque<Result<ScriptedSource, DeviceError>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(opens: Vec<Result<ScriptedSource, DeviceError>>) -> Self {
        Self {
            opens: Mutex::new(opens.into()),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connect_count(&self) -> Arc<AtomicUsize> {
        self.connects.clone()
    }
}

#[async_trait]
impl DeviceConnector for ScriptedConnector {
    type Source = ScriptedSource;

    async fn connect(&self) -> Result<Self::Source, DeviceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.opens.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(DeviceError::Open {
                port: "scripted".to_string(),
                message: "no device attached".to_string(),
            })
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Serve `response` to every connection, then close it. Returns the base URL.
pub async fn raw_http_server(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// A 200 whose body stops short of its declared length.
pub const TRUNCATED_OK: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"sta";

/// Log sink over the real file that fails while its switch is on.
///
/// A failing write leaves half a record on disk, like a full device.
pub struct FaultySink {
    file: File,
    failing: Arc<AtomicBool>,
    rollback_fails: bool,
}

impl FaultySink {
    pub fn new(path: &Path, rollback_fails: bool) -> (Self, Arc<AtomicBool>) {
        let failing = Arc::new(AtomicBool::new(true));
        let sink = Self {
            file: OpenOptions::new().append(true).open(path).unwrap(),
            failing: failing.clone(),
            rollback_fails,
        };
        (sink, failing)
    }
}

impl Write for FaultySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            self.file.write_all(&buf[..buf.len() / 2])?;
            return Err(std::io::Error::other("no space left on device"));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl LogSink for FaultySink {
    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        if self.rollback_fails {
            return Err(std::io::Error::other("device removed"));
        }
        self.file.set_len(len)
    }
}
