//! Retry logic with backoff, per-attempt timeouts and a total time budget.
//!
//! The session's stream reconnect loop uses a fixed delay and stops once the
//! next sleep would overrun its budget; exponential backoff with jitter is
//! available for callers that want it.

use crate::error::{PuppetServiceError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one). `None` means
    /// only the budget limits the loop.
    pub max_attempts: Option<u32>,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (1.0 keeps the delay fixed).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Option<Duration>,
    /// Total time the loop may spend, sleeps included.
    pub budget: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            attempt_timeout: None,
            budget: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Same delay before every retry, no jitter, no attempt cap.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
            jitter: false,
            attempt_timeout: None,
            budget: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
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

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in 0.5..1.5 keeps the mean delay and never approaches zero.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Whether the loop stopped because the budget ran out.
    pub budget_exhausted: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation.
///
/// Returns the final result together with the statistics. An attempt that
/// exceeds `attempt_timeout` fails with [`PuppetServiceError::Timeout`] and
/// counts as retryable if `should_retry` says so.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&PuppetServiceError) -> bool,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stats = RetryStats::default();
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        stats.attempts = attempt + 1;

        let outcome = match config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, operation())
                .await
                .unwrap_or_else(|_| Err(PuppetServiceError::Timeout(limit))),
            None => operation().await,
        };

        let e = match outcome {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        stats.last_error = Some(e.to_string());

        if !should_retry(&e) {
            debug!("Error is not retryable: {}", e);
            return (Err(e), stats);
        }

        if let Some(max) = config.max_attempts {
            if attempt + 1 >= max {
                warn!("All {} retry attempts exhausted. Last error: {}", max, e);
                return (Err(e), stats);
            }
        }

        let delay = config.calculate_delay(attempt);

        if let Some(budget) = config.budget {
            if started.elapsed() + delay >= budget {
                warn!(
                    "Retry budget of {:?} exhausted after {} attempts. Last error: {}",
                    budget, stats.attempts, e
                );
                stats.budget_exhausted = true;
                return (Err(e), stats);
            }
        }

        stats.total_delay += delay;
        warn!(
            "Attempt {} failed: {}. Retrying in {:?}",
            attempt + 1,
            e,
            delay
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
