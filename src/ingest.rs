//! Ingestion loop: device → parser → log → uplink queue.
//!
//! One task owns the serial device and the append path. It moves between
//! [`LinkState`]s as the device comes and goes, and only hands sequence ids
//! to the uplink worker after the reading is durable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::{DeviceConnector, DeviceError, LineSource};
use crate::parser::{parse_line, ParsedLine};
use crate::store::{ReadingLog, StorageError};

/// Connection state of the serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    Faulted,
}

/// Timing and fault limits for the loop.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Wait after opening the device before the first read
    pub settle_delay: Duration,

    /// Wait in `Faulted` before trying to reopen
    pub reconnect_delay: Duration,

    /// Consecutive failed reopen attempts tolerated, `None` for unlimited
    pub max_reconnect_attempts: Option<u32>,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: config.settle_delay,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Statistics about ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Lines received from the device
    pub lines_read: u64,

    /// Readings durably appended to the log
    pub readings_accepted: u64,

    /// Non-reading device output
    pub diagnostics: u64,

    /// Record-shaped lines rejected by the parser
    pub rejected: u64,

    /// Accepted readings outside the pH range
    pub out_of_range: u64,

    /// Readings not queued because the uplink queue was full
    pub queue_overflows: u64,

    /// Successful reopens after a device fault
    pub reconnects: u64,
}

/// Fatal ingestion failures.
#[derive(Debug)]
pub enum IngestError {
    /// The device could not be opened at startup
    DeviceUnavailable(DeviceError),

    /// The device stayed unavailable past the reconnect ceiling
    ReconnectExhausted { attempts: u32, last_error: DeviceError },

    /// A reading could not be made durable
    Storage(StorageError),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::DeviceUnavailable(e) => write!(f, "Serial device unavailable: {}", e),
            IngestError::ReconnectExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "Serial device still unavailable after {} reconnect attempts: {}",
                attempts, last_error
            ),
            IngestError::Storage(e) => write!(f, "Reading could not be stored: {}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::DeviceUnavailable(e) => Some(e),
            IngestError::ReconnectExhausted { last_error, .. } => Some(last_error),
            IngestError::Storage(e) => Some(e),
        }
    }
}

/// Arrival timestamps that never go backwards, even if the wall clock does.
#[derive(Debug, Clone, Default)]
pub struct ArrivalClock {
    last: Option<DateTime<Utc>>,
}

impl ArrivalClock {
    /// Continue after `last`, typically the newest timestamp in the log.
    pub fn resume(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    pub fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamped = match self.last {
            Some(last) if now < last => {
                debug!(
                    now = %now,
                    last = %last,
                    "Wall clock stepped backwards, holding arrival time"
                );
                last
            }
            _ => now,
        };
        self.last = Some(stamped);
        stamped
    }
}

/// The sequential task that owns the device and the log's append path.
pub struct IngestLoop<C: DeviceConnector> {
    connector: C,
    log: Arc<ReadingLog>,
    uplink_tx: mpsc::Sender<u64>,
    settings: IngestSettings,
    clock: ArrivalClock,
    stats: IngestStats,
}

impl<C: DeviceConnector> IngestLoop<C> {
    pub fn new(
        connector: C,
        log: Arc<ReadingLog>,
        uplink_tx: mpsc::Sender<u64>,
        settings: IngestSettings,
    ) -> Result<Self, StorageError> {
        let clock = ArrivalClock::resume(log.last_timestamp()?);

        Ok(Self {
            connector,
            log,
            uplink_tx,
            settings,
            clock,
            stats: IngestStats::default(),
        })
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Device faults are recovered by reopening the device. Only a failed
    /// first open, an exhausted reconnect ceiling or a storage fault end the
    /// loop with an error. The device handle is released before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<IngestStats, IngestError> {
        let device = self.connector.describe();
        let mut state = LinkState::Disconnected;
        let mut source: Option<C::Source> = None;
        let mut ever_connected = false;
        let mut failed_reopens: u32 = 0;

        info!(device = %device, "Ingestion loop started");

        loop {
            match state {
                LinkState::Disconnected => {
                    let opened = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.connector.connect() => Some(result),
                    };
                    let Some(opened) = opened else { break };

                    match opened {
                        Ok(new_source) => {
                            if ever_connected {
                                self.stats.reconnects += 1;
                                info!(device = %device, "Serial device reconnected");
                            }
                            ever_connected = true;
                            failed_reopens = 0;

                            if !self.settings.settle_delay.is_zero()
                                && !sleep_or_cancel(self.settings.settle_delay, &cancel).await
                            {
                                break;
                            }

                            source = Some(new_source);
                            state = LinkState::Connected;
                            info!(device = %device, "Listening for readings");
                        }
                        Err(e) if !ever_connected => {
                            error!(device = %device, error = %e, "Cannot open serial device");
                            return Err(IngestError::DeviceUnavailable(e));
                        }
                        Err(e) => {
                            failed_reopens += 1;
                            if let Some(max) = self.settings.max_reconnect_attempts {
                                if failed_reopens >= max {
                                    error!(
                                        device = %device,
                                        attempts = failed_reopens,
                                        error = %e,
                                        "Giving up on serial device"
                                    );
                                    return Err(IngestError::ReconnectExhausted {
                                        attempts: failed_reopens,
                                        last_error: e,
                                    });
                                }
                            }
                            warn!(
                                device = %device,
                                attempt = failed_reopens,
                                error = %e,
                                "Reconnect failed"
                            );
                            state = LinkState::Faulted;
                        }
                    }
                }

                LinkState::Connected => {
                    let Some(src) = source.as_mut() else {
                        state = LinkState::Disconnected;
                        continue;
                    };

                    let read = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = src.read_line() => Some(result),
                    };
                    let Some(read) = read else { break };

                    match read {
                        Ok(Some(line)) => self.handle_line(&line).await?,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(device = %device, error = %e, "Serial device fault");
                            source = None;
                            state = LinkState::Faulted;
                        }
                    }
                }

                LinkState::Faulted => {
                    if !sleep_or_cancel(self.settings.reconnect_delay, &cancel).await {
                        break;
                    }
                    state = LinkState::Disconnected;
                }
            }
        }

        drop(source);
        info!(
            device = %device,
            lines_read = self.stats.lines_read,
            readings_accepted = self.stats.readings_accepted,
            rejected = self.stats.rejected,
            "Ingestion loop stopped, device released"
        );

        Ok(self.stats)
    }

    /// Process one line. Only a storage fault is returned as an error.
    async fn handle_line(&mut self, line: &str) -> Result<(), IngestError> {
        self.stats.lines_read += 1;
        let received_at = self.clock.stamp(Utc::now());

        match parse_line(line, received_at) {
            Ok(ParsedLine::Reading(reading)) => {
                let record = reading.clone();
                let appended = self.log.blocking(move |log| log.append(&record)).await;
                let sequence_id = appended.map_err(|e| {
                    error!(
                        error = %e,
                        device_millis = reading.device_millis,
                        ph = reading.ph_value,
                        "Failed to persist reading, halting ingestion"
                    );
                    IngestError::Storage(e)
                })?;
                self.stats.readings_accepted += 1;

                if !reading.is_in_range() {
                    self.stats.out_of_range += 1;
                    warn!(
                        sequence_id = sequence_id,
                        ph = reading.ph_value,
                        "pH reading outside 0-14, possible sensor drift"
                    );
                }

                info!(
                    sequence_id = sequence_id,
                    ph = reading.ph_value,
                    device_millis = reading.device_millis,
                    "Reading accepted"
                );

                match self.uplink_tx.try_send(sequence_id) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.stats.queue_overflows += 1;
                        debug!(
                            sequence_id = sequence_id,
                            "Uplink queue full, reading left for rescan"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(
                            sequence_id = sequence_id,
                            "Uplink queue closed, reading stays pending"
                        );
                    }
                }
            }
            Ok(ParsedLine::Diagnostic(text)) => {
                self.stats.diagnostics += 1;
                debug!(target: "ph_telemetry::device", line = %text, "Device diagnostic");
            }
            Ok(ParsedLine::Empty) => {}
            Err(e) => {
                self.stats.rejected += 1;
                warn!(
                    reason = %e.reason,
                    line = %e.line,
                    detail = %e.detail,
                    "Rejected device line"
                );
            }
        }

        Ok(())
    }
}

/// Sleep for `duration`; returns `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::DeliveryState;
    use crate::test_support::{
        wait_until, FaultySink, ScriptStep, ScriptedConnector, ScriptedSource,
    };
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    fn settings(max_reconnect_attempts: Option<u32>) -> IngestSettings {
        IngestSettings {
            settle_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(1),
            max_reconnect_attempts,
        }
    }

    fn open_log() -> (TempDir, Arc<ReadingLog>) {
        let dir = tempdir().unwrap();
        let log = Arc::new(ReadingLog::open(dir.path().join("readings.jsonl")).unwrap());
        (dir, log)
    }

    fn lines(lines: &[&str]) -> ScriptedSource {
        ScriptedSource::new(lines.iter().map(|l| ScriptStep::Line(format!("{}\n", l))).collect())
    }

    #[test]
    fn test_arrival_clock_never_goes_backwards() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut clock = ArrivalClock::resume(Some(t0));

        let earlier = t0 - chrono::Duration::seconds(30);
        let later = t0 + chrono::Duration::seconds(5);

        assert_eq!(clock.stamp(earlier), t0);
        assert_eq!(clock.stamp(later), later);
        assert_eq!(clock.stamp(t0), later);
    }

    #[tokio::test]
    async fn test_lines_flow_into_log_and_queue() {
        let (_dir, log) = open_log();
        let (tx, mut rx) = mpsc::channel(16);
        let connector = ScriptedConnector::new(vec![Ok(lines(&[
            "Booting pH probe",
            "pH,120000,6.994",
            "garbage,xx",
            "",
            "pH,121000,15.5",
        ]))]);

        let cancel = CancellationToken::new();
        let ingest = IngestLoop::new(connector, log.clone(), tx, settings(None)).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        wait_until(|| log.counts().unwrap().pending == 2).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        let pending = log.scan_pending().unwrap();
        assert_eq!(pending[0].reading.device_millis, 120_000);
        assert!((pending[0].reading.ph_value - 6.994).abs() < 1e-12);
        assert_eq!(pending[0].state, DeliveryState::Pending);
        assert!(pending[0].reading.timestamp <= pending[1].reading.timestamp);

        assert_eq!(stats.lines_read, 5);
        assert_eq!(stats.readings_accepted, 2);
        assert_eq!(stats.diagnostics, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.out_of_range, 1);
    }

    #[tokio::test]
    async fn test_malformed_line_leaves_log_untouched() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(16);
        let connector = ScriptedConnector::new(vec![Ok(lines(&["garbage,xx", "pH,1,7.0"]))]);

        let cancel = CancellationToken::new();
        let ingest = IngestLoop::new(connector, log.clone(), tx, settings(None)).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        wait_until(|| log.counts().unwrap().pending == 1).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        // Only the valid line consumed a sequence id.
        assert_eq!(log.scan_pending().unwrap()[0].sequence_id, 1);
        assert_eq!(log.next_sequence_id().unwrap(), 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_device_fault() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(16);

        let first = ScriptedSource::new(vec![
            ScriptStep::Line("pH,1,7.0\n".to_string()),
            ScriptStep::Idle,
            ScriptStep::Fail,
        ]);
        let connector = ScriptedConnector::new(vec![
            Ok(first),
            Err(DeviceError::Open {
                port: "scripted".to_string(),
                message: "busy".to_string(),
            }),
            Ok(lines(&["pH,2,7.1"])),
        ]);
        let connects = connector.connect_count();

        let cancel = CancellationToken::new();
        let ingest = IngestLoop::new(connector, log.clone(), tx, settings(Some(5))).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        wait_until(|| log.counts().unwrap().pending == 2).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(stats.reconnects, 1);
        let ids: Vec<u64> = log.scan_pending().unwrap().iter().map(|r| r.sequence_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_first_open_failure_is_fatal() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(16);
        let connector = ScriptedConnector::new(vec![]);

        let ingest = IngestLoop::new(connector, log, tx, settings(None)).unwrap();
        let result = ingest.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(IngestError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_reconnect_ceiling_is_fatal() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(16);
        let source = ScriptedSource::new(vec![ScriptStep::Fail]);
        let connector = ScriptedConnector::new(vec![Ok(source)]);

        let ingest = IngestLoop::new(connector, log, tx, settings(Some(3))).unwrap();
        let run = ingest.run(CancellationToken::new());
        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("loop should give up");

        match result {
            Err(IngestError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected reconnect exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_ingestion() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(1);
        let source = lines(&["pH,1,7.0", "pH,2,7.0", "pH,3,7.0"]);
        let connector = ScriptedConnector::new(vec![Ok(source)]);

        let cancel = CancellationToken::new();
        let ingest = IngestLoop::new(connector, log.clone(), tx, settings(None)).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        wait_until(|| log.counts().unwrap().pending == 3).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.readings_accepted, 3);
        assert_eq!(stats.queue_overflows, 2);
    }

    #[tokio::test]
    async fn test_cancel_while_idle_releases_device() {
        let (_dir, log) = open_log();
        let (tx, _rx) = mpsc::channel(16);
        let source = lines(&[]);
        let released = source.released_flag();
        let connector = ScriptedConnector::new(vec![Ok(source)]);

        let cancel = CancellationToken::new();
        let ingest = IngestLoop::new(connector, log, tx, settings(None)).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop on cancel")
            .unwrap()
            .unwrap();

        assert_eq!(stats.readings_accepted, 0);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_ingest_error_display() {
        let err = IngestError::ReconnectExhausted {
            attempts: 4,
            last_error: DeviceError::Disconnected,
        };
        assert!(err.to_string().contains("after 4 reconnect attempts"));
    }

    #[tokio::test]
    async fn test_storage_fault_halts_ingestion() {
        let (_dir, log) = open_log();
        let (sink, _failing) = FaultySink::new(log.path(), false);
        log.replace_sink(Box::new(sink));

        let (tx, mut rx) = mpsc::channel(16);
        let connector = ScriptedConnector::new(vec![Ok(lines(&["pH,1,7.0", "pH,2,7.1"]))]);

        let ingest = IngestLoop::new(connector, log.clone(), tx, settings(None)).unwrap();
        let run = ingest.run(CancellationToken::new());
        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("loop should halt on its own");

        assert!(matches!(result, Err(IngestError::Storage(StorageError::Io(_)))));
        assert!(rx.try_recv().is_err());
        assert_eq!(log.next_sequence_id().unwrap(), 1);
        assert_eq!(log.counts().unwrap().total(), 0);
    }
}
