//! Durable local log of accepted readings.
//!
//! The log is an append-only JSON Lines file. Every line is one record:
//!
//! ```text
//! {"op":"header","log_id":"6f1c...","version":1}
//! {"op":"append","sequence_id":1,"timestamp":"2025-06-01T08:30:00Z","device_millis":120000,"ph":6.994}
//! {"op":"state","sequence_id":1,"state":"delivered"}
//! ```
//!
//! `append` is durable (`sync_data`) before it returns. On reopen the file is
//! replayed to rebuild the pending set and the sequence counter. A torn final
//! line left by a crash mid-write is truncated away. Anything else that fails
//! to replay is reported as corruption.
//!
//! The core never compacts or truncates committed records; retention is an
//! external concern.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reading::{DeliveryState, LoggedReading, Reading};

/// On-disk format version written into the header record.
const LOG_FORMAT_VERSION: u32 = 1;

/// One line of the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Header {
        log_id: Uuid,
        version: u32,
    },
    Append {
        sequence_id: u64,
        timestamp: DateTime<Utc>,
        device_millis: u64,
        ph: f64,
    },
    State {
        sequence_id: u64,
        state: DeliveryState,
    },
}

/// Errors raised by the local log. Any of these is a storage fault.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying file operation failed
    Io(std::io::Error),

    /// The file could not be replayed
    Corrupt { line: usize, message: String },

    /// No record with this sequence id exists
    UnknownSequence(u64),

    /// The record already reached a different terminal state
    InvalidTransition {
        sequence_id: u64,
        from: DeliveryState,
        to: DeliveryState,
    },

    /// The reading cannot be represented in the log
    InvalidReading(String),

    /// An earlier write could not be rolled back, or a writer panicked
    Poisoned,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Log I/O failed: {}", e),
            StorageError::Corrupt { line, message } => {
                write!(f, "Log is corrupt at line {}: {}", line, message)
            }
            StorageError::UnknownSequence(seq) => write!(f, "Unknown sequence id {}", seq),
            StorageError::InvalidTransition {
                sequence_id,
                from,
                to,
            } => write!(
                f,
                "Sequence {} is already {}, cannot mark {}",
                sequence_id, from, to
            ),
            StorageError::InvalidReading(e) => write!(f, "Invalid reading: {}", e),
            StorageError::Poisoned => {
                write!(f, "Log is unusable after an unrecoverable write failure")
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Record counts by delivery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCounts {
    pub pending: u64,
    pub delivered: u64,
    pub failed_permanent: u64,
}

impl LogCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.delivered + self.failed_permanent
    }
}

/// Destination of log writes.
///
/// `File` in production; tests substitute sinks that fail on demand.
pub(crate) trait LogSink: Write + Send {
    fn sync(&mut self) -> std::io::Result<()>;

    /// Cut the sink back to `len` bytes.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

struct LogInner {
    file: Box<dyn LogSink>,

    /// Committed length of the file in bytes
    len: u64,

    next_sequence_id: u64,
    last_timestamp: Option<DateTime<Utc>>,

    pending: BTreeMap<u64, Reading>,
    failed: BTreeMap<u64, Reading>,
    delivered: u64,

    poisoned: bool,
}

impl LogInner {
    fn state_of(&self, sequence_id: u64) -> Option<DeliveryState> {
        if self.pending.contains_key(&sequence_id) {
            Some(DeliveryState::Pending)
        } else if self.failed.contains_key(&sequence_id) {
            Some(DeliveryState::FailedPermanent)
        } else if sequence_id >= 1 && sequence_id < self.next_sequence_id {
            Some(DeliveryState::Delivered)
        } else {
            None
        }
    }

    /// Append one record and sync it. On failure the file is cut back to its
    /// committed length so a partial line never precedes later records.
    fn write_record(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        if self.poisoned {
            return Err(StorageError::Poisoned);
        }

        let mut buf = serde_json::to_vec(record)
            .map_err(|e| StorageError::InvalidReading(e.to_string()))?;
        buf.push(b'\n');

        let written = self.file.write_all(&buf).and_then(|_| self.file.sync());
        match written {
            Ok(()) => {
                self.len += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.truncate(self.len) {
                    warn!(
                        error = %rollback,
                        committed_len = self.len,
                        "Failed to roll back partial log write, log is now unusable"
                    );
                    self.poisoned = true;
                }
                Err(StorageError::Io(e))
            }
        }
    }
}

/// Append-only durable log of readings and their delivery state.
///
/// All mutations take one exclusive lock, so appends from the ingestion task
/// and state changes from the uplink worker cannot interleave.
pub struct ReadingLog {
    path: PathBuf,
    log_id: Uuid,
    inner: Mutex<LogInner>,
}

impl ReadingLog {
    /// Open the log at `path`, creating it if missing and replaying it
    /// otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let data = std::fs::read(&path)?;
        let (records, valid_len) = split_records(&data)?;

        if valid_len < data.len() as u64 {
            warn!(
                path = %path.display(),
                discarded_bytes = data.len() as u64 - valid_len,
                "Discarding torn record at end of log"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        let mut inner = LogInner {
            file: Box::new(file),
            len: valid_len,
            next_sequence_id: 1,
            last_timestamp: None,
            pending: BTreeMap::new(),
            failed: BTreeMap::new(),
            delivered: 0,
            poisoned: false,
        };

        let log_id = match records.first() {
            None => {
                let log_id = Uuid::new_v4();
                inner.write_record(&LogRecord::Header {
                    log_id,
                    version: LOG_FORMAT_VERSION,
                })?;
                info!(path = %path.display(), log_id = %log_id, "Created reading log");
                log_id
            }
            Some((_, LogRecord::Header { log_id, version })) => {
                if *version != LOG_FORMAT_VERSION {
                    return Err(StorageError::Corrupt {
                        line: 1,
                        message: format!("unsupported log version {}", version),
                    });
                }
                *log_id
            }
            Some((line, _)) => {
                return Err(StorageError::Corrupt {
                    line: *line,
                    message: "missing header record".to_string(),
                });
            }
        };

        for (line, record) in records.into_iter().skip(1) {
            replay(&mut inner, line, record)?;
        }

        if !inner.pending.is_empty() || inner.next_sequence_id > 1 {
            info!(
                path = %path.display(),
                next_sequence_id = inner.next_sequence_id,
                pending = inner.pending.len(),
                failed_permanent = inner.failed.len(),
                delivered = inner.delivered,
                "Reopened reading log"
            );
        }

        Ok(Self {
            path,
            log_id,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Durably append a reading and return its sequence id.
    ///
    /// When this returns `Ok` the reading is accepted; when it returns `Err`
    /// nothing was committed and the sequence counter did not move.
    pub fn append(&self, reading: &Reading) -> Result<u64, StorageError> {
        if !reading.ph_value.is_finite() {
            return Err(StorageError::InvalidReading(format!(
                "pH value {} is not finite",
                reading.ph_value
            )));
        }

        let mut inner = self.lock()?;
        let sequence_id = inner.next_sequence_id;

        inner.write_record(&LogRecord::Append {
            sequence_id,
            timestamp: reading.timestamp,
            device_millis: reading.device_millis,
            ph: reading.ph_value,
        })?;

        inner.next_sequence_id += 1;
        inner.last_timestamp = Some(match inner.last_timestamp {
            Some(last) if last > reading.timestamp => last,
            _ => reading.timestamp,
        });
        inner.pending.insert(sequence_id, reading.clone());

        debug!(sequence_id = sequence_id, "Appended reading");
        Ok(sequence_id)
    }

    /// All pending readings in sequence order.
    pub fn scan_pending(&self) -> Result<Vec<LoggedReading>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .pending
            .iter()
            .map(|(seq, reading)| LoggedReading {
                sequence_id: *seq,
                reading: reading.clone(),
                state: DeliveryState::Pending,
            })
            .collect())
    }

    /// All permanently failed readings in sequence order.
    pub fn scan_failed(&self) -> Result<Vec<LoggedReading>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .failed
            .iter()
            .map(|(seq, reading)| LoggedReading {
                sequence_id: *seq,
                reading: reading.clone(),
                state: DeliveryState::FailedPermanent,
            })
            .collect())
    }

    /// The reading with this sequence id, if it is still pending.
    pub fn pending(&self, sequence_id: u64) -> Result<Option<LoggedReading>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.pending.get(&sequence_id).map(|reading| LoggedReading {
            sequence_id,
            reading: reading.clone(),
            state: DeliveryState::Pending,
        }))
    }

    /// Current delivery state of a sequence id.
    pub fn state(&self, sequence_id: u64) -> Result<Option<DeliveryState>, StorageError> {
        Ok(self.lock()?.state_of(sequence_id))
    }

    pub fn mark_delivered(&self, sequence_id: u64) -> Result<(), StorageError> {
        self.mark(sequence_id, DeliveryState::Delivered)
    }

    pub fn mark_failed_permanent(&self, sequence_id: u64) -> Result<(), StorageError> {
        self.mark(sequence_id, DeliveryState::FailedPermanent)
    }

    fn mark(&self, sequence_id: u64, to: DeliveryState) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        match inner.state_of(sequence_id) {
            None => return Err(StorageError::UnknownSequence(sequence_id)),
            Some(DeliveryState::Pending) => {}
            Some(current) if current == to => return Ok(()),
            Some(from) => {
                return Err(StorageError::InvalidTransition {
                    sequence_id,
                    from,
                    to,
                })
            }
        }

        inner.write_record(&LogRecord::State {
            sequence_id,
            state: to,
        })?;

        if let Some(reading) = inner.pending.remove(&sequence_id) {
            match to {
                DeliveryState::FailedPermanent => {
                    inner.failed.insert(sequence_id, reading);
                }
                _ => inner.delivered += 1,
            }
        }

        Ok(())
    }

    /// Sequence id the next append will receive.
    pub fn next_sequence_id(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.next_sequence_id)
    }

    /// Latest timestamp committed to the log.
    pub fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.lock()?.last_timestamp)
    }

    pub fn counts(&self) -> Result<LogCounts, StorageError> {
        let inner = self.lock()?;
        Ok(LogCounts {
            pending: inner.pending.len() as u64,
            delivered: inner.delivered,
            failed_permanent: inner.failed.len() as u64,
        })
    }

    /// Identity of this log instance, stable across reopens.
    pub fn log_id(&self) -> Uuid {
        self.log_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on the blocking pool.
    ///
    /// Every mutation ends in `sync_data`, which can stall for as long as the
    /// disk takes; async callers go through here instead of calling directly.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&ReadingLog) -> Result<T, StorageError> + Send + 'static,
    {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&log))
            .await
            .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::other(e.to_string()))))
    }

    /// Route further writes to `sink`.
    #[cfg(test)]
    pub(crate) fn replace_sink(&self, sink: Box<dyn LogSink>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.file = sink;
        }
    }
}

/// Split raw file contents into numbered records.
///
/// Returns the records and the byte length of the valid prefix. Only the
/// final line may be torn; a bad line followed by more data is corruption.
fn split_records(data: &[u8]) -> Result<(Vec<(usize, LogRecord)>, u64), StorageError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < data.len() {
        line_no += 1;
        let rest = &data[offset..];

        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            // Unterminated tail: the write never completed.
            break;
        };

        let raw = &rest[..newline];
        let end = offset + newline + 1;

        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<LogRecord>(text).map_err(|e| e.to_string()));

        match parsed {
            Ok(record) => records.push((line_no, record)),
            Err(_) if end == data.len() => break,
            Err(message) => {
                return Err(StorageError::Corrupt {
                    line: line_no,
                    message,
                })
            }
        }

        offset = end;
    }

    Ok((records, offset as u64))
}

fn replay(inner: &mut LogInner, line: usize, record: LogRecord) -> Result<(), StorageError> {
    match record {
        LogRecord::Header { .. } => Err(StorageError::Corrupt {
            line,
            message: "duplicate header record".to_string(),
        }),
        LogRecord::Append {
            sequence_id,
            timestamp,
            device_millis,
            ph,
        } => {
            if sequence_id != inner.next_sequence_id {
                return Err(StorageError::Corrupt {
                    line,
                    message: format!(
                        "expected sequence id {}, found {}",
                        inner.next_sequence_id, sequence_id
                    ),
                });
            }
            inner.next_sequence_id += 1;
            inner.last_timestamp = Some(match inner.last_timestamp {
                Some(last) if last > timestamp => last,
                _ => timestamp,
            });
            inner
                .pending
                .insert(sequence_id, Reading::new(timestamp, device_millis, ph));
            Ok(())
        }
        LogRecord::State { sequence_id, state } => {
            if !state.is_terminal() {
                return Err(StorageError::Corrupt {
                    line,
                    message: format!("explicit {} state for sequence id {}", state, sequence_id),
                });
            }
            let Some(reading) = inner.pending.remove(&sequence_id) else {
                return Err(StorageError::Corrupt {
                    line,
                    message: format!("state change for non-pending sequence id {}", sequence_id),
                });
            };
            if state == DeliveryState::FailedPermanent {
                inner.failed.insert(sequence_id, reading);
            } else {
                inner.delivered += 1;
            }
            Ok(())
        }
    }
}
