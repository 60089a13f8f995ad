pub mod artifact;
pub mod config;
pub mod connection;
pub mod controller;
pub mod deadline;
pub mod dump;
pub mod error;
pub mod mysql;
pub mod outcome;
pub mod retry;
pub mod storage;
pub mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use aws_sdk_s3::Client as S3Client;
use lambda_runtime::{Error, LambdaEvent};
use tracing::{error, info};

pub use artifact::{artifact_key, BackupArtifact};
pub use config::{BackupJobConfig, DatabaseConfig, RawConfig, Secret, Tuning};
pub use connection::{ConnectionManager, DatabaseConnector, DumpSession};
pub use controller::{BackupController, Invocation, ScheduledEvent};
pub use deadline::{Deadline, Watchdog};
pub use dump::{DumpExecutor, DumpFrame, DumpSummary};
pub use error::{ConfigurationError, ConnectError, DumpError, UploadError};
pub use mysql::MysqlConnector;
pub use outcome::{BackupOutcome, OutcomeMetrics, OutcomeStatus, DEFAULT_METRICS_NAMESPACE};
pub use retry::RetryPolicy;
pub use storage::{ObjectStore, PartReceipt, S3ObjectStore, TransferHandle};
pub use upload::{UploadPipeline, UploadSession};

/// Wires the backup controller to MySQL, S3 and CloudWatch.
pub struct RdsBackupService {
    raw: RawConfig,
    controller: BackupController<MysqlConnector, dyn ObjectStore>,
    metrics: OutcomeMetrics,
}

impl RdsBackupService {
    pub async fn new() -> Result<Self, Error> {
        let raw = RawConfig::from_env();
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let (bucket_region, mysqldump) = client_settings(&raw);

        // The bucket may live outside the function's region.
        let s3_client = match bucket_region {
            Some(region) => {
                let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .region(Region::new(region))
                    .build();
                S3Client::from_conf(s3_config)
            }
            None => S3Client::new(&sdk_config),
        };

        let namespace = std::env::var("METRICS_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_METRICS_NAMESPACE.to_string());

        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(s3_client));
        Ok(Self {
            raw,
            controller: BackupController::new(MysqlConnector::new(mysqldump), store),
            metrics: OutcomeMetrics::new(CloudWatchClient::new(&sdk_config), namespace),
        })
    }

    /// Runs one backup for the scheduled event and returns its outcome.
    ///
    /// Every status is returned as `Ok`; the outcome record carries failures.
    pub async fn handle(&self, event: LambdaEvent<ScheduledEvent>) -> Result<BackupOutcome, Error> {
        let invocation = Invocation::from_runtime(event.payload.time, event.context.deadline);
        info!(
            request_id = %event.context.request_id,
            event_id = event.payload.id.as_deref().unwrap_or_default(),
            "Scheduled backup triggered"
        );

        let outcome = self.controller.run(&self.raw, invocation).await;
        outcome.log();

        if let Err(e) = self.metrics.publish(&outcome).await {
            error!("Outcome metrics were not published: {}", e);
        }
        Ok(outcome)
    }
}

/// Bucket region and dump program, taken from the resolved configuration.
///
/// An unresolvable configuration is reported by the controller on every run,
/// before either value is used.
fn client_settings(raw: &RawConfig) -> (Option<String>, PathBuf) {
    match raw.resolve() {
        Ok(job) => (job.bucket_region, job.mysqldump_path),
        Err(_) => (None, PathBuf::from(config::DEFAULT_MYSQLDUMP)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawConfig {
        RawConfig::builder()
            .db_host("orders-db.internal")
            .db_user("backup")
            .db_password("s3cr3t")
            .db_name("orders")
            .bucket_name("orders-rds-backup")
            .build()
    }

    #[test]
    fn test_blank_settings_fall_back_to_defaults() {
        let raw = RawConfig {
            mysqldump_path: Some("  ".to_string()),
            bucket_region: Some(String::new()),
            ..raw()
        };

        let (region, mysqldump) = client_settings(&raw);
        assert_eq!(region, None);
        assert_eq!(mysqldump, PathBuf::from("mysqldump"));
    }

    #[test]
    fn test_settings_are_trimmed() {
        let raw = RawConfig {
            mysqldump_path: Some(" /opt/bin/mysqldump ".to_string()),
            bucket_region: Some(" eu-west-1\n".to_string()),
            ..raw()
        };

        let (region, mysqldump) = client_settings(&raw);
        assert_eq!(region.as_deref(), Some("eu-west-1"));
        assert_eq!(mysqldump, PathBuf::from("/opt/bin/mysqldump"));
    }
}
