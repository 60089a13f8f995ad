use std::fmt;

use aws_sdk_cloudwatch::{
    types::{Dimension, MetricDatum, StandardUnit},
    Client as CloudWatchClient,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::artifact::BackupArtifact;

pub const DEFAULT_METRICS_NAMESPACE: &str = "RdsBackup";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    ConfigurationFailed,
    ConnectivityFailed,
    DumpFailed,
    UploadFailed,
    DeadlineExceeded,
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "Succeeded",
            Self::ConfigurationFailed => "ConfigurationFailed",
            Self::ConnectivityFailed => "ConnectivityFailed",
            Self::DumpFailed => "DumpFailed",
            Self::UploadFailed => "UploadFailed",
            Self::DeadlineExceeded => "DeadlineExceeded",
        };
        f.write_str(name)
    }
}

/// The single record an invocation reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    pub status: OutcomeStatus,
    pub database: Option<String>,
    pub bytes_processed: u64,
    pub artifact_key: Option<String>,
    pub artifact: Option<BackupArtifact>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BackupOutcome {
    /// Emits the outcome as one structured log event.
    pub fn log(&self) {
        let record = serde_json::to_string(self).unwrap_or_default();
        if self.status.is_success() {
            info!(
                status = %self.status,
                bytes_processed = self.bytes_processed,
                artifact_key = self.artifact_key.as_deref().unwrap_or_default(),
                outcome = %record,
                "Backup finished"
            );
        } else {
            error!(
                status = %self.status,
                bytes_processed = self.bytes_processed,
                error = self.error.as_deref().unwrap_or_default(),
                outcome = %record,
                "Backup finished"
            );
        }
    }
}

/// Publishes outcome metrics to CloudWatch.
pub struct OutcomeMetrics {
    client: CloudWatchClient,
    namespace: String,
}

impl OutcomeMetrics {
    pub fn new(client: CloudWatchClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub async fn publish(&self, outcome: &BackupOutcome) -> Result<(), lambda_runtime::Error> {
        let timestamp = aws_sdk_cloudwatch::primitives::DateTime::from(std::time::SystemTime::from(
            outcome.finished_at,
        ));
        let dimensions = outcome
            .database
            .as_ref()
            .map(|db| vec![Dimension::builder().name("Database").value(db).build()])
            .unwrap_or_default();

        let metrics = metric_values(outcome)
            .into_iter()
            .map(|(name, value, unit)| {
                MetricDatum::builder()
                    .metric_name(name)
                    .value(value)
                    .unit(unit)
                    .timestamp(timestamp.clone())
                    .set_dimensions(Some(dimensions.clone()))
                    .build()
            })
            .collect::<Vec<_>>();

        info!(
            "Publishing {} metrics to CloudWatch namespace {}",
            metrics.len(),
            self.namespace
        );

        match self
            .client
            .put_metric_data()
            .namespace(&self.namespace)
            .set_metric_data(Some(metrics))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to publish metrics: {}", e);
                Err(lambda_runtime::Error::from(e))
            }
        }
    }
}

fn metric_values(outcome: &BackupOutcome) -> Vec<(&'static str, f64, StandardUnit)> {
    let mut values = vec![
        (
            "BackupSucceeded",
            if outcome.status.is_success() { 1.0 } else { 0.0 },
            StandardUnit::Count,
        ),
        (
            "BackupDurationMs",
            outcome.duration_ms as f64,
            StandardUnit::Milliseconds,
        ),
        (
            "BackupBytes",
            outcome.bytes_processed as f64,
            StandardUnit::Bytes,
        ),
    ];
    if let Some(artifact) = &outcome.artifact {
        values.push((
            "BackupArtifactBytes",
            artifact.size_bytes as f64,
            StandardUnit::Bytes,
        ));
    }
    values
}
