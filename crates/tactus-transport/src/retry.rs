//! Capped exponential retry for recoverable transport operations.

use std::future::Future;
use std::time::Duration;

/// Retry policy with exponential backoff.
///
/// Used for connection establishment and region attachment, where the peer
/// may simply not be up yet. The backoff doubles per attempt and is capped
/// so a long outage does not produce hour-long sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles afterwards.
    pub initial_backoff: Duration,
}

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, initial_backoff: Duration::from_millis(100) }
    }
}

impl RetryPolicy {
    /// Backoff to sleep after the `attempt`-th failure (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `operation` until it succeeds or attempts are exhausted.
    ///
    /// Returns the last error once `max_attempts` have failed.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) {
                        tracing::warn!(%error, what, attempt, "giving up after final attempt");
                        return Err(error);
                    }
                    let backoff = self.backoff(attempt - 1);
                    tracing::debug!(%error, what, attempt, ?backoff, "retrying after backoff");
                    tokio::time::sleep(backoff).await;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy { max_attempts: 10, initial_backoff: Duration::from_millis(100) };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(30), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let policy = RetryPolicy { max_attempts: 5, initial_backoff: Duration::from_millis(1) };
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("not yet".to_owned()) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_surfaces_last_error() {
        let policy = RetryPolicy { max_attempts: 3, initial_backoff: Duration::from_millis(1) };
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .run("test op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(format!("failure {n}")) }
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
