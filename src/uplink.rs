//! Reliable delivery of logged readings to the remote collector.
//!
//! [`Uplink`] wraps a [`Transport`] with a bounded exponential backoff and
//! records every terminal outcome on the [`ReadingLog`]. [`uplink_worker`]
//! runs it as an independent task fed by a queue of sequence ids, so a slow
//! or unreachable collector never stalls serial acquisition.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ReadingPayload, Transport};
use crate::reading::LoggedReading;
use crate::store::ReadingLog;

/// Exponential backoff with a cap and an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// `max_attempts` counts every attempt, including the first, and is at
    /// least 1.
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before `attempt` (1-based).
    ///
    /// The first attempt is immediate; attempt `n` waits
    /// `min(base * 2^(n-2), cap)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Outcome of delivering one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    /// The collector stored the reading
    Delivered { remote_id: Option<i64>, attempts: u32 },

    /// Transient failure; the reading stays pending
    RetryableFailure { attempts: u32, reason: String },

    /// Retrying cannot help, or attempts are exhausted
    PermanentFailure { attempts: u32, reason: String },
}

/// Whether a failed exchange is worth repeating.
///
/// Retryable errors include:
/// - Transport errors (connect, send, body read), except a request that
///   could not be built
/// - Timeouts
/// - Server errors (5xx)
/// - Rate limiting (429)
pub fn is_retryable_error(error: &ClientError) -> bool {
    match error {
        ClientError::Request(e) => !e.is_builder(),
        ClientError::Timeout => true,
        ClientError::Status { code, .. } => {
            code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
        }
        ClientError::Parse(_) => false,
        ClientError::Config(_) => false,
    }
}

/// Statistics about uplink operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkStats {
    /// Readings confirmed by the collector
    pub delivered: u64,

    /// Readings marked failed-permanent
    pub failed_permanent: u64,

    /// Attempts beyond the first
    pub retries: u64,

    /// Deliveries abandoned at shutdown, still pending in the log
    pub left_pending: u64,
}

/// Delivers logged readings and records the outcome in the log.
pub struct Uplink<T: Transport> {
    transport: T,
    log: Arc<ReadingLog>,
    policy: RetryPolicy,
    api_key: String,
    stats: RwLock<UplinkStats>,
}

impl<T: Transport> Uplink<T> {
    pub fn new(
        transport: T,
        log: Arc<ReadingLog>,
        policy: RetryPolicy,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            log,
            policy,
            api_key: api_key.into(),
            stats: RwLock::new(UplinkStats::default()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Get current uplink statistics.
    pub fn stats(&self) -> UplinkStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Make one delivery attempt and classify it. The log is not touched.
    pub async fn attempt(&self, logged: &LoggedReading) -> DeliveryResult {
        let payload = ReadingPayload::new(logged, &self.api_key, self.log.log_id());

        match self.transport.post_reading(&payload).await {
            Ok(response) => DeliveryResult::Delivered {
                remote_id: response.id,
                attempts: 1,
            },
            Err(e) if is_retryable_error(&e) => DeliveryResult::RetryableFailure {
                attempts: 1,
                reason: e.to_string(),
            },
            Err(e) => DeliveryResult::PermanentFailure {
                attempts: 1,
                reason: e.to_string(),
            },
        }
    }

    /// Deliver a reading with retries, then record the terminal outcome.
    ///
    /// Returns `RetryableFailure` only when `cancel` fires during a backoff
    /// wait; the reading is then left pending for the next resume scan.
    pub async fn deliver(
        &self,
        logged: &LoggedReading,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let sequence_id = logged.sequence_id;
        let mut attempt = 1;

        let result = loop {
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = cancel.cancelled() => true,
                };
                if cancelled {
                    break DeliveryResult::RetryableFailure {
                        attempts: attempt - 1,
                        reason: "shutdown during backoff".to_string(),
                    };
                }
                self.update_stats(|s| s.retries += 1);
            }

            match self.attempt(logged).await {
                DeliveryResult::Delivered { remote_id, .. } => {
                    break DeliveryResult::Delivered {
                        remote_id,
                        attempts: attempt,
                    };
                }
                DeliveryResult::RetryableFailure { reason, .. }
                    if attempt < self.policy.max_attempts =>
                {
                    warn!(
                        sequence_id = sequence_id,
                        error = %reason,
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = self.policy.delay_before(attempt + 1).as_millis() as u64,
                        "Delivery failed, will retry"
                    );
                    attempt += 1;
                }
                DeliveryResult::RetryableFailure { reason, .. } => {
                    break DeliveryResult::PermanentFailure {
                        attempts: attempt,
                        reason: format!("all {} attempts failed, last error: {}", attempt, reason),
                    };
                }
                DeliveryResult::PermanentFailure { reason, .. } => {
                    break DeliveryResult::PermanentFailure {
                        attempts: attempt,
                        reason,
                    };
                }
            }
        };

        self.record(logged, &result).await;
        result
    }

    async fn record(&self, logged: &LoggedReading, result: &DeliveryResult) {
        let sequence_id = logged.sequence_id;

        match result {
            DeliveryResult::Delivered { remote_id, attempts } => {
                info!(
                    sequence_id = sequence_id,
                    remote_id = ?remote_id,
                    attempts = attempts,
                    ph = logged.reading.ph_value,
                    "Reading delivered"
                );
                let marked = self
                    .log
                    .blocking(move |log| log.mark_delivered(sequence_id))
                    .await;
                match marked {
                    Ok(()) => self.update_stats(|s| s.delivered += 1),
                    Err(e) => error!(
                        sequence_id = sequence_id,
                        error = %e,
                        "Failed to record delivery, reading stays pending"
                    ),
                }
            }
            DeliveryResult::PermanentFailure { reason, attempts } => {
                error!(
                    sequence_id = sequence_id,
                    attempts = attempts,
                    error = %reason,
                    "Reading failed permanently, retained in local log"
                );
                let marked = self
                    .log
                    .blocking(move |log| log.mark_failed_permanent(sequence_id))
                    .await;
                match marked {
                    Ok(()) => self.update_stats(|s| s.failed_permanent += 1),
                    Err(e) => error!(
                        sequence_id = sequence_id,
                        error = %e,
                        "Failed to record permanent failure, reading stays pending"
                    ),
                }
            }
            DeliveryResult::RetryableFailure { reason, .. } => {
                info!(
                    sequence_id = sequence_id,
                    reason = %reason,
                    "Delivery interrupted, reading left pending"
                );
                self.update_stats(|s| s.left_pending += 1);
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut UplinkStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Deliver one sequence id if it is still pending.
    ///
    /// Ids that were already settled (queued twice, or picked up by a rescan)
    /// are skipped.
    async fn process(&self, sequence_id: u64, cancel: &CancellationToken) {
        match self.log.pending(sequence_id) {
            Ok(Some(logged)) => {
                self.deliver(&logged, cancel).await;
            }
            Ok(None) => debug!(sequence_id = sequence_id, "Skipping settled reading"),
            Err(e) => error!(
                sequence_id = sequence_id,
                error = %e,
                "Failed to load pending reading"
            ),
        }
    }

    /// Offer every pending reading, in log order.
    async fn rescan(&self, cancel: &CancellationToken) {
        let pending = match self.log.scan_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to scan pending readings");
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        info!(pending = pending.len(), "Resuming delivery of pending readings");
        for logged in pending {
            if cancel.is_cancelled() {
                break;
            }
            self.process(logged.sequence_id, cancel).await;
        }
    }
}

/// The uplink task.
///
/// Consumes sequence ids from `rx` and rescans the log every
/// `rescan_interval`; the first rescan runs immediately and resumes
/// deliveries left pending by a previous run. Ends when `cancel` fires or
/// the queue closes. A delivery already in flight is allowed to finish its
/// current request; new work is not started after cancellation.
pub async fn uplink_worker<T: Transport>(
    uplink: Arc<Uplink<T>>,
    mut rx: mpsc::Receiver<u64>,
    rescan_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(rescan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Uplink worker cancelled");
                break;
            }

            _ = ticker.tick() => {
                uplink.rescan(&cancel).await;
            }

            maybe_seq = rx.recv() => {
                match maybe_seq {
                    Some(sequence_id) => uplink.process(sequence_id, &cancel).await,
                    None => {
                        debug!("Uplink queue closed");
                        break;
                    }
                }
            }
        }
    }

    let stats = uplink.stats();
    info!(
        delivered = stats.delivered,
        failed_permanent = stats.failed_permanent,
        retries = stats.retries,
        left_pending = stats.left_pending,
        "Uplink worker stopped"
    );
}
