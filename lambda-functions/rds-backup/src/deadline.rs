use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A point in time by which the invocation must have returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn earliest(self, other: Deadline) -> Deadline {
        self.min(other)
    }

    /// The instant at which work must stop so that `margin` is left for cleanup.
    pub fn less(&self, margin: Duration) -> Instant {
        self.0.checked_sub(margin).unwrap_or_else(Instant::now)
    }
}

/// Cancels its token once the deadline minus the safety margin is reached.
///
/// The watchdog task is aborted when the value is dropped, so it never outlives
/// the invocation that armed it.
pub struct Watchdog {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn arm(deadline: Deadline, safety_margin: Duration) -> Self {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let trip_at = deadline.less(safety_margin);

        let task_token = token.clone();
        let task_fired = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(trip_at) => {
                    warn!(
                        safety_margin_ms = safety_margin.as_millis() as u64,
                        "Deadline approaching, cancelling backup"
                    );
                    task_fired.store(true, Ordering::SeqCst);
                    task_token.cancel();
                }
                _ = task_token.cancelled() => {}
            }
        });

        Self {
            token,
            fired,
            handle,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
