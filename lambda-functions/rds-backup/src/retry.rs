use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded exponential backoff shared by the connect and part-upload loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

#[derive(Debug)]
pub enum RetryError {
    Exhausted { attempts: u32, cause: anyhow::Error },
    Cancelled,
}

/// Runs `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// Cancellation is observed both while an attempt is in flight and during backoff.
pub async fn retry_cancellable<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };

        let cause = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if policy.is_last(attempt) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                cause,
            });
        }

        let backoff = policy.backoff_after(attempt);
        warn!(
            operation,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %format!("{cause:#}"),
            "Attempt failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(8));

        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(5), Duration::from_secs(8));
        assert_eq!(policy.backoff_after(9), Duration::from_secs(8));
        assert_eq!(policy.backoff_after(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.is_last(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_bound() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));

        let result: Result<(), _> = retry_cancellable(&policy, &CancellationToken::new(), "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("503 Slow Down")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let value = retry_cancellable(&policy, &CancellationToken::new(), "probe", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    anyhow::bail!("timeout");
                }
                Ok(call)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 1);
    }
}
