//! Exponential backoff for operations that cross a network boundary.
//!
//! A failure is retried only when it matches one of the policy's transient
//! signatures and its kind is not permanent, so syntax and validation
//! errors surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::{codes, DatabaseError, DbResult};

/// Backoff policy. `max_retries` counts every attempt, the first included.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Normalized codes (exact match) or message fragments (substring match)
    pub retryable_signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retryable_signatures: default_signatures(),
        }
    }
}

fn default_signatures() -> Vec<String> {
    [
        codes::CONNECTION_REFUSED,
        codes::CONNECTION_RESET,
        codes::TIMED_OUT,
        codes::HOST_UNREACHABLE,
        codes::BROKEN_PIPE,
        codes::CONNECTION_LOST,
        codes::POOL_TIMEOUT,
        codes::QUERY_TIMEOUT,
        "connection refused",
        "connection reset",
        "timed out",
        "host unreachable",
        "broken pipe",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl RetryPolicy {
    /// Interactive connection test: a user is waiting
    pub fn connection_test() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Opening a pool for the cache
    pub fn pool_bootstrap() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Per-statement execution; fails fast
    pub fn query_execution() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_signatures = signatures.into_iter().map(Into::into).collect();
        self
    }

    /// Pause after failed attempt `attempt` (1-indexed):
    /// `min(base * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent so powi never overflows into inf/NaN territory
        let exponent = (attempt - 1).min(30) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }

    /// Transient signature match on a non-permanent kind
    pub fn is_retryable(&self, err: &DatabaseError) -> bool {
        if err.kind.is_permanent() {
            return false;
        }

        let message = err.message.to_lowercase();
        self.retryable_signatures.iter().any(|signature| {
            err.code.as_deref() == Some(signature.as_str())
                || message.contains(&signature.to_lowercase())
        })
    }
}

/// What a retried operation produced, and what it cost
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: DbResult<T>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Drop the bookkeeping. Exhausted failures carry the attempt count and
    /// elapsed time as error details.
    pub fn into_result(self) -> DbResult<T> {
        let attempts = self.attempts;
        let elapsed = self.elapsed;
        self.result.map_err(|err| {
            if attempts > 1 {
                err.with_detail(format!(
                    "gave up after {} attempts in {} ms",
                    attempts,
                    elapsed.as_millis()
                ))
            } else {
                err
            }
        })
    }
}

/// Runs async operations under one [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryService {
    policy: RetryPolicy,
}

impl RetryService {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation = operation_name, attempts, "Succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                Err(err) => {
                    if attempts >= max_attempts || !self.policy.is_retryable(&err) {
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                            elapsed: start.elapsed(),
                        };
                    }

                    let delay = self.policy.delay_for_attempt(attempts);
                    warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
