use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use rds_backup::{BackupOutcome, RdsBackupService, ScheduledEvent};

async fn function_handler(event: LambdaEvent<ScheduledEvent>) -> Result<BackupOutcome, Error> {
    let service = RdsBackupService::new().await?;
    service.handle(event).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    run(service_fn(function_handler)).await
}
