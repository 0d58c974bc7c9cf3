//! Bounded retry with per-kind exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::{ErrorTracker, StorageError, StorageErrorKind, StorageResult};

/// Retry budget for one error kind.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    /// Extra attempts allowed after the first failure.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
}

/// Per-kind retry budgets with an overall backoff cap.
///
/// Only connection, timeout and resource failures carry a budget; every
/// other kind surfaces after a single attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Budget for connection failures.
    pub connection: RetryBudget,
    /// Budget for timeouts.
    pub timeout: RetryBudget,
    /// Budget for resource exhaustion.
    pub resource: RetryBudget,
    /// Upper bound for a single backoff sleep.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connection: RetryBudget {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
            },
            timeout: RetryBudget {
                max_retries: 2,
                base_delay: Duration::from_millis(1000),
            },
            resource: RetryBudget {
                max_retries: 2,
                base_delay: Duration::from_millis(2000),
            },
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Default budgets with zero delays, for tests.
    pub fn instant() -> Self {
        Self {
            connection: RetryBudget {
                max_retries: 3,
                base_delay: Duration::ZERO,
            },
            timeout: RetryBudget {
                max_retries: 2,
                base_delay: Duration::ZERO,
            },
            resource: RetryBudget {
                max_retries: 2,
                base_delay: Duration::ZERO,
            },
            max_delay: Duration::ZERO,
        }
    }

    fn budget(&self, error: &StorageError) -> Option<RetryBudget> {
        if !error.is_retryable() {
            return None;
        }
        match error.kind() {
            Some(StorageErrorKind::Connection) => Some(self.connection),
            Some(StorageErrorKind::Timeout) => Some(self.timeout),
            Some(StorageErrorKind::Resource) => Some(self.resource),
            _ => None,
        }
    }

    /// Extra attempts allowed for `error`; zero when it is not retryable.
    pub fn max_retries(&self, error: &StorageError) -> u32 {
        self.budget(error).map(|b| b.max_retries).unwrap_or(0)
    }

    /// Backoff before retry `attempt` (zero-based), capped at `max_delay`.
    pub fn delay_for(&self, error: &StorageError, attempt: u32) -> Duration {
        match self.budget(error) {
            Some(budget) => budget
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(self.max_delay),
            None => Duration::ZERO,
        }
    }
}

/// Runs storage operations, retrying transient failures with backoff.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    tracker: Option<Arc<ErrorTracker>>,
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            tracker: None,
        }
    }

    /// Records every classified failure into `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Runs `operation`, re-invoking it after transient failures.
    ///
    /// Non-retryable errors surface after exactly one attempt. Retryable
    /// ones are retried up to their kind's budget with exponential
    /// backoff, then the last error is returned.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if let Some(tracker) = &self.tracker {
                        tracker.record_error(&error, operation_name);
                    }

                    let budget = self.policy.max_retries(&error);
                    if attempt >= budget {
                        if budget > 0 {
                            warn!(
                                operation = operation_name,
                                attempts = attempt + 1,
                                error = %error,
                                "retries exhausted"
                            );
                        }
                        return Err(error);
                    }

                    let delay = self.policy.delay_for(&error, attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        kind = error.kind().map(|k| k.as_str()).unwrap_or("unclassified"),
                        severity = error.severity().map(|s| s.as_str()).unwrap_or("unclassified"),
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
