//! Process lifecycle: wires the log, the uplink worker and the ingestion
//! loop together and tears them down in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::Transport;
use crate::config::Config;
use crate::device::DeviceConnector;
use crate::ingest::{IngestError, IngestLoop, IngestSettings, IngestStats};
use crate::store::{LogCounts, ReadingLog, StorageError};
use crate::uplink::{uplink_worker, Uplink, UplinkStats};

/// Readings requested by the startup reachability probe.
const PROBE_LIMIT: usize = 5;

/// Time a cancelled worker gets to record its last outcome before abort.
const ABORT_WAIT: Duration = Duration::from_millis(250);

/// Fatal pipeline failures.
#[derive(Debug)]
pub enum PipelineError {
    /// The reading log could not be opened or read
    Storage(StorageError),

    /// The ingestion loop stopped with a fatal error
    Ingest(IngestError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Storage(e) => write!(f, "Reading log error: {}", e),
            PipelineError::Ingest(e) => write!(f, "Ingestion failed: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Storage(e) => Some(e),
            PipelineError::Ingest(e) => Some(e),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Storage(err)
    }
}

impl From<IngestError> for PipelineError {
    fn from(err: IngestError) -> Self {
        PipelineError::Ingest(err)
    }
}

/// What a run did, reported at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ingest: IngestStats,
    pub uplink: UplinkStats,
    pub log: LogCounts,
}

/// The telemetry pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Run until `shutdown` fires or ingestion fails fatally.
    ///
    /// Pending readings from earlier runs are re-offered first. At shutdown
    /// the uplink worker gets `config.shutdown_grace` to finish; anything it
    /// cannot confirm stays pending in the log for the next run.
    pub async fn run<C, T>(
        config: &Config,
        connector: C,
        transport: T,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, PipelineError>
    where
        C: DeviceConnector,
        T: Transport + 'static,
    {
        let log = Arc::new(ReadingLog::open(&config.log_path)?);
        let counts = log.counts()?;
        info!(
            path = %log.path().display(),
            log_id = %log.log_id(),
            pending = counts.pending,
            delivered = counts.delivered,
            failed_permanent = counts.failed_permanent,
            "Reading log opened"
        );

        let uplink = Arc::new(Uplink::new(
            transport,
            log.clone(),
            config.retry,
            config.api_key.clone(),
        ));

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker_cancel = CancellationToken::new();
        let mut worker = tokio::spawn(uplink_worker(
            uplink.clone(),
            rx,
            config.rescan_interval,
            worker_cancel.clone(),
        ));

        tokio::select! {
            _ = probe_collector(uplink.transport()) => {}
            _ = shutdown.cancelled() => {}
        }

        let settings = IngestSettings::from_config(config);
        let result = match IngestLoop::new(connector, log.clone(), tx, settings) {
            Ok(ingest) => ingest.run(shutdown.clone()).await,
            Err(e) => Err(IngestError::Storage(e)),
        };

        // The ingestion loop owned the only sender, so the worker now drains
        // what is queued and stops.
        info!(
            grace_secs = config.shutdown_grace.as_secs_f64(),
            "Waiting for in-flight deliveries"
        );
        match tokio::time::timeout(config.shutdown_grace, &mut worker).await {
            Ok(Ok(())) => info!("Uplink worker shut down gracefully"),
            Ok(Err(e)) => warn!(error = %e, "Uplink worker panicked during shutdown"),
            Err(_) => {
                warn!(
                    "Uplink worker shutdown timed out after {:?}, unresolved readings stay pending",
                    config.shutdown_grace
                );
                worker_cancel.cancel();
                if tokio::time::timeout(ABORT_WAIT, &mut worker).await.is_err() {
                    worker.abort();
                }
            }
        }

        let ingest = match result {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Ingestion stopped with a fatal error");
                return Err(PipelineError::Ingest(e));
            }
        };

        let summary = RunSummary {
            ingest,
            uplink: uplink.stats(),
            log: log.counts()?,
        };

        info!(
            readings_accepted = summary.ingest.readings_accepted,
            rejected = summary.ingest.rejected,
            delivered = summary.uplink.delivered,
            failed_permanent = summary.uplink.failed_permanent,
            still_pending = summary.log.pending,
            "Pipeline stopped"
        );

        Ok(summary)
    }
}

/// Startup reachability check; failures are only logged.
async fn probe_collector<T: Transport>(transport: &T) {
    match transport.fetch_readings(PROBE_LIMIT).await {
        Ok(readings) => info!(recent = readings.len(), "Collector reachable"),
        Err(e) => warn!(
            error = %e,
            "Collector not reachable at startup, readings will queue locally"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::test_support::{
        ok_response, status_error, wait_until, ScriptStep, ScriptedConnector, ScriptedSource,
        ScriptedTransport,
    };
    use crate::uplink::RetryPolicy;
    use std::path::Path;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        Config {
            log_path: dir.join("readings.jsonl"),
            settle_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(1),
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3),
            shutdown_grace: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    fn device(lines: &[&str]) -> ScriptedConnector {
        let steps = lines.iter().map(|l| ScriptStep::Line(format!("{}\n", l))).collect();
        ScriptedConnector::new(vec![Ok(ScriptedSource::new(steps))])
    }

    #[tokio::test]
    async fn test_reading_is_delivered_and_garbage_ignored() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_response(7))]));

        let shutdown = CancellationToken::new();
        let handle = {
            let config = config.clone();
            let transport = transport.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                Pipeline::run(
                    &config,
                    device(&["Booting", "pH,120000,6.994", "garbage,xx"]),
                    transport,
                    shutdown,
                )
                .await
            })
        };

        wait_until(|| transport.calls() == 1).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.ingest.readings_accepted, 1);
        assert_eq!(summary.ingest.rejected, 1);
        assert_eq!(summary.ingest.diagnostics, 1);
        assert_eq!(summary.uplink.delivered, 1);
        assert_eq!(summary.log.delivered, 1);
        assert_eq!(summary.log.total(), 1);

        let posted = transport.posted();
        assert_eq!(posted[0].sequence_id, 1);
        assert!((posted[0].ph - 6.994).abs() < 1e-12);
        assert_eq!(posted[0].api_key, config.api_key);
    }

    #[tokio::test]
    async fn test_unauthorized_reading_is_retained_as_failed() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![Err(status_error(401))]));

        let shutdown = CancellationToken::new();
        let handle = {
            let config = config.clone();
            let transport = transport.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                Pipeline::run(&config, device(&["pH,1000,7.25"]), transport, shutdown).await
            })
        };

        wait_until(|| transport.calls() == 1).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.uplink.failed_permanent, 1);
        assert_eq!(summary.log.failed_permanent, 1);
        assert_eq!(transport.calls(), 1);

        let log = ReadingLog::open(&config.log_path).unwrap();
        let failed = log.scan_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert!((failed[0].reading.ph_value - 7.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_restart_resumes_pending_readings() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.retry = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60), 5);
        config.shutdown_grace = Duration::from_millis(50);

        // First run: the collector is down, the reading stays pending.
        let down = Arc::new(ScriptedTransport::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let handle = {
            let config = config.clone();
            let down = down.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                Pipeline::run(&config, device(&["pH,1000,6.9"]), down, shutdown).await
            })
        };

        wait_until(|| down.calls() == 1).await;
        shutdown.cancel();
        let first = handle.await.unwrap().unwrap();
        assert_eq!(first.log.pending, 1);
        assert_eq!(first.uplink.delivered, 0);

        // Second run: the collector is back.
        config.retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3);
        config.shutdown_grace = Duration::from_secs(1);
        let up = Arc::new(ScriptedTransport::always_ok());
        let shutdown = CancellationToken::new();
        let handle = {
            let config = config.clone();
            let up = up.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                Pipeline::run(&config, device(&["pH,2000,7.1"]), up, shutdown).await
            })
        };

        wait_until(|| up.calls() == 2).await;
        shutdown.cancel();
        let second = handle.await.unwrap().unwrap();

        assert_eq!(second.log.pending, 0);
        assert_eq!(second.log.delivered, 2);

        let posted = up.posted();
        let ids: Vec<u64> = posted.iter().map(|p| p.sequence_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(posted[0].log_id, down.posted()[0].log_id);
    }

    #[tokio::test]
    async fn test_unreachable_collector_probe_is_not_fatal() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let transport = Arc::new(ScriptedTransport::always_ok().with_failing_listing());

        let shutdown = CancellationToken::new();
        let handle = {
            let config = config.clone();
            let transport = transport.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                Pipeline::run(&config, device(&["pH,1000,7.0"]), transport, shutdown).await
            })
        };

        wait_until(|| transport.calls() == 1).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.uplink.delivered, 1);
    }

    #[tokio::test]
    async fn test_missing_device_is_fatal() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let connector = ScriptedConnector::new(vec![Err(DeviceError::Open {
            port: "/dev/ttyACM0".to_string(),
            message: "No such file or directory".to_string(),
        })]);

        let result = Pipeline::run(
            &config,
            connector,
            ScriptedTransport::always_ok(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PipelineError::Ingest(IngestError::DeviceUnavailable(_)))
        ));
    }
}
