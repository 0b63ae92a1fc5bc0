//! Retry with exponential backoff for pipeline stage calls.
//!
//! Every attempt runs under a finite timeout. Only transient failures are
//! retried; permanent ones return after the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StageError;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never zero.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(60))
    }
}

/// Result of a retried call together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StageError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            attempt_timeout,
        }
    }

    /// Policy for a stage configured with `retries` extra attempts.
    pub fn for_stage(retries: u32, initial_delay: Duration, attempt_timeout: Duration) -> Self {
        Self::exponential(retries.saturating_add(1), initial_delay, attempt_timeout)
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay.min(u64::MAX as f64) as u64).min(self.max_delay)
    }

    pub async fn run<F, Fut, T>(&self, stage: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(stage, attempt, max = self.max_attempts, "stage attempt");

            let outcome = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::transient(format!(
                    "{stage} timed out after {}s",
                    self.attempt_timeout.as_secs_f64()
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(stage, attempt, "stage succeeded after retries");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.calculate_delay(attempt);
                    warn!(
                        stage,
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(stage, attempt, error = %err, "stage failed");
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
