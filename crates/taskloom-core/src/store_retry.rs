//! Bounded local retry of transient store failures.
//!
//! Every store call is capped by a timeout. Timeouts, lock contention and
//! dropped connections are retried with exponential backoff up to
//! `max_attempts`; anything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use taskloom_types::config::StoreConfig;
use taskloom_types::error::RepositoryError;

/// Timeout and attempt budget for store calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.query_timeout_secs),
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &RepositoryError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Backoff after attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Run `op` under `policy`, retrying transient failures.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RepositoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::Timeout),
        };
        match result {
            Err(e) if policy.should_retry(attempt, &e) => {
                tracing::debug!(attempt, error = %e, "retrying transient store failure");
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
