use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::deadline::Deadline;
use crate::error::ConnectError;
use crate::retry::RetryPolicy;

/// Opens sessions against the source database.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    type Session: DumpSession;

    async fn open(&self, config: &DatabaseConfig) -> anyhow::Result<Self::Session>;
}

/// An open database handle plus the read position of one export.
#[async_trait]
pub trait DumpSession: Send {
    /// Starts the export. The snapshot the stream represents is fixed here.
    async fn begin_export(&mut self) -> anyhow::Result<()>;

    /// Reads at most `max_len` bytes of the export; `None` is the end of the stream.
    async fn read_chunk(&mut self, max_len: usize) -> anyhow::Result<Option<Bytes>>;

    /// Releases every resource held by the session. Safe to call repeatedly.
    async fn close(&mut self);
}

pub struct ConnectionManager {
    retry: RetryPolicy,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(retry: RetryPolicy, connect_timeout: Duration) -> Self {
        Self {
            retry,
            connect_timeout,
        }
    }

    pub async fn connect<C: DatabaseConnector>(
        &self,
        connector: &C,
        config: &DatabaseConfig,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<C::Session, ConnectError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let budget = self.connect_timeout.min(deadline.remaining());

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled { attempts: attempt - 1 }),
                result = tokio::time::timeout(budget, connector.open(config)) => result,
            };

            let cause = match result {
                Ok(Ok(session)) => {
                    info!(
                        host = %config.host,
                        port = config.port,
                        attempt,
                        "Connected to database"
                    );
                    return Ok(session);
                }
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!("connect timed out after {}ms", budget.as_millis()),
            };

            if self.retry.is_last(attempt) {
                return Err(ConnectError::Exhausted {
                    attempts: attempt,
                    cause,
                });
            }

            let backoff = self.retry.backoff_after(attempt);
            if deadline.remaining() < backoff + self.connect_timeout {
                warn!(
                    attempt,
                    remaining_ms = deadline.remaining().as_millis() as u64,
                    "Not enough time left for another connect attempt"
                );
                return Err(ConnectError::Exhausted {
                    attempts: attempt,
                    cause,
                });
            }

            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %format!("{cause:#}"),
                "Connect attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    pub async fn close<S: DumpSession>(session: &mut S) {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NullSession;

    #[async_trait]
    impl DumpSession for NullSession {
        async fn begin_export(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_chunk(&mut self, _max_len: usize) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }

        async fn close(&mut self) {}
    }

    struct FlakyConnector {
        failures_before_success: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DatabaseConnector for FlakyConnector {
        type Session = NullSession;

        async fn open(&self, _config: &DatabaseConfig) -> anyhow::Result<NullSession> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                anyhow::bail!("connection refused (call {call})");
            }
            Ok(NullSession)
        }
    }

    fn database() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.internal".to_string(),
            port: 3306,
            user: "bak".to_string(),
            password: Secret::new("x"),
            name: "orders".to_string(),
        }
    }

    fn manager(attempts: u32) -> ConnectionManager {
        ConnectionManager::new(
            RetryPolicy::new(attempts, Duration::from_millis(500), Duration::from_secs(8)),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            failures_before_success: 2,
            calls: calls.clone(),
        };

        let result = manager(4)
            .connect(
                &connector,
                &database(),
                Deadline::after(Duration::from_secs(300)),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_retry_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            failures_before_success: u32::MAX,
            calls: calls.clone(),
        };

        let err = manager(4)
            .connect(
                &connector,
                &database(),
                Deadline::after(Duration::from_secs(300)),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("connection refused (call 4)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stops_early_when_budget_is_short() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            failures_before_success: u32::MAX,
            calls: calls.clone(),
        };

        let err = manager(10)
            .connect(
                &connector,
                &database(),
                Deadline::after(Duration::from_secs(12)),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        // Backoffs of 0.5s and 1s fit; after the third failure 10.5s remain, short of 2s + 10s.
        assert!(matches!(err, ConnectError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_observes_cancellation() {
        let connector = FlakyConnector {
            failures_before_success: u32::MAX,
            calls: Arc::new(AtomicU32::new(0)),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager(4)
            .connect(
                &connector,
                &database(),
                Deadline::after(Duration::from_secs(300)),
                &cancel,
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ConnectError::Cancelled { .. }));
    }
}
