//! Bounded retry with exponential backoff for historical fetches.

use crate::service::ServiceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tally_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay after the first failure; doubled for each later one.
    pub base_backoff: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or attempts run out. The last error is
    /// returned; nothing is retried after that.
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => ServiceError::Store(e),
                Err(_) => ServiceError::Timeout(self.timeout),
            };

            if attempt >= attempts {
                tracing::warn!(what, attempt, error = %err, "fetch failed; giving up");
                return Err(err);
            }

            let delay = self.backoff(attempt);
            tracing::debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "fetch failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.saturating_mul(1u32 << (attempt - 1).min(16));
        let jitter_ms = (exp.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }
}
