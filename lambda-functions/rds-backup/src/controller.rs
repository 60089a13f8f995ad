use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::artifact::artifact_key;
use crate::config::{BackupJobConfig, RawConfig};
use crate::connection::{ConnectionManager, DatabaseConnector};
use crate::deadline::{Deadline, Watchdog};
use crate::dump::DumpExecutor;
use crate::error::ConnectError;
use crate::outcome::{BackupOutcome, OutcomeStatus};
use crate::storage::ObjectStore;
use crate::upload::UploadPipeline;

/// The scheduled event that fires the function. Only the fire time is used.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ScheduledEvent {
    pub id: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

/// When the invocation started and when it must be done by.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    pub started_at: DateTime<Utc>,
    pub deadline: Deadline,
}

impl Invocation {
    pub fn new(started_at: DateTime<Utc>, deadline: Deadline) -> Self {
        Self {
            started_at,
            deadline,
        }
    }

    /// Builds an invocation from the runtime deadline, given in epoch milliseconds.
    pub fn from_runtime(event_time: Option<DateTime<Utc>>, deadline_epoch_ms: u64) -> Self {
        let now = Utc::now();
        let remaining_ms = (deadline_epoch_ms as i64 - now.timestamp_millis()).max(0) as u64;
        Self {
            started_at: event_time.unwrap_or(now),
            deadline: Deadline::after(Duration::from_millis(remaining_ms)),
        }
    }
}

/// Runs one backup end to end and reports exactly one outcome.
pub struct BackupController<C, S: ?Sized> {
    connector: C,
    store: Arc<S>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Dump,
    Upload,
}

impl<C, S> BackupController<C, S>
where
    C: DatabaseConnector,
    S: ObjectStore + ?Sized,
{
    pub fn new(connector: C, store: Arc<S>) -> Self {
        Self { connector, store }
    }

    pub async fn run(&self, raw: &RawConfig, invocation: Invocation) -> BackupOutcome {
        let clock = Instant::now();
        let mut report = Report::new(invocation.started_at, clock);

        let config = match raw.resolve() {
            Ok(config) => config,
            Err(e) => return report.finish(OutcomeStatus::ConfigurationFailed, Some(e.to_string())),
        };
        report.database = Some(config.database.name.clone());

        info!(
            function = %config.function_name,
            database = %config.database.name,
            bucket = %config.bucket,
            schedule = %config.schedule,
            "Function init, backing up db..."
        );

        self.execute(&config, invocation, &mut report).await
    }

    async fn execute(
        &self,
        config: &BackupJobConfig,
        invocation: Invocation,
        report: &mut Report,
    ) -> BackupOutcome {
        let tuning = &config.tuning;
        let deadline = invocation
            .deadline
            .earliest(Deadline::at(report.clock + config.timeout));
        let watchdog = Watchdog::arm(deadline, tuning.safety_margin);

        let manager = ConnectionManager::new(tuning.connect_retry, tuning.connect_timeout);
        let mut session = match manager
            .connect(&self.connector, &config.database, deadline, watchdog.token())
            .await
        {
            Ok(session) => session,
            Err(ConnectError::Cancelled { .. }) => {
                return report.finish(
                    OutcomeStatus::DeadlineExceeded,
                    Some("deadline reached while connecting".to_string()),
                )
            }
            Err(e) => return report.finish(OutcomeStatus::ConnectivityFailed, Some(e.to_string())),
        };

        let key = artifact_key(&config.key_prefix, &config.database.name, invocation.started_at);
        info!(key = %key, "Backup created, uploading to S3...");

        let pipeline_cancel = watchdog.token().child_token();
        let first_failure = OnceLock::new();
        let (tx, rx) = mpsc::channel(tuning.channel_capacity);
        let executor = DumpExecutor::new(tuning.chunk_size);
        let pipeline =
            UploadPipeline::new(&*self.store, tuning.part_size, tuning.part_retry, deadline);

        let dump = async {
            let result = executor.run(&mut session, tx, &pipeline_cancel).await;
            if result.is_err() {
                let _ = first_failure.set(Stage::Dump);
                pipeline_cancel.cancel();
            }
            result
        };
        let upload = async {
            let result = pipeline.upload(rx, &config.bucket, &key, &pipeline_cancel).await;
            if result.is_err() {
                let _ = first_failure.set(Stage::Upload);
                pipeline_cancel.cancel();
            }
            result
        };
        let (dumped, uploaded) = tokio::join!(dump, upload);

        ConnectionManager::close(&mut session).await;

        report.bytes_processed = match &dumped {
            Ok(summary) => summary.bytes,
            Err(e) => e.bytes_produced,
        };

        let upload_err = match uploaded {
            Ok(artifact) => {
                info!("Backup uploaded to S3, done.");
                report.artifact = Some(artifact);
                return report.finish(OutcomeStatus::Succeeded, None);
            }
            Err(e) => e,
        };

        if watchdog.fired() {
            warn!(error = %upload_err, "Backup aborted by deadline");
            return report.finish(
                OutcomeStatus::DeadlineExceeded,
                Some(format!(
                    "deadline reached with {}ms safety margin left",
                    tuning.safety_margin.as_millis()
                )),
            );
        }

        match (first_failure.get(), dumped) {
            (Some(Stage::Dump), Err(dump_err)) => {
                report.finish(OutcomeStatus::DumpFailed, Some(dump_err.to_string()))
            }
            _ => report.finish(OutcomeStatus::UploadFailed, Some(upload_err.to_string())),
        }
    }
}

struct Report {
    started_at: DateTime<Utc>,
    clock: Instant,
    database: Option<String>,
    bytes_processed: u64,
    artifact: Option<crate::artifact::BackupArtifact>,
}

impl Report {
    fn new(started_at: DateTime<Utc>, clock: Instant) -> Self {
        Self {
            started_at,
            clock,
            database: None,
            bytes_processed: 0,
            artifact: None,
        }
    }

    fn finish(&mut self, status: OutcomeStatus, error: Option<String>) -> BackupOutcome {
        let elapsed = self.clock.elapsed();
        let artifact = self.artifact.take();
        BackupOutcome {
            status,
            database: self.database.clone(),
            bytes_processed: self.bytes_processed,
            artifact_key: artifact.as_ref().map(|a| a.key.clone()),
            artifact,
            error,
            started_at: self.started_at,
            finished_at: self.started_at
                + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero()),
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}
