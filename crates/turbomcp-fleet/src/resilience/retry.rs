//! Retry logic with configurable backoff
//!
//! [`RetryPolicy`] retries transient failures (network, server, rate limit)
//! and gives up immediately on permanent ones (auth, protocol, configuration).
//! When attempts run out the last error is returned unchanged.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, DurationSecondsWithFrac, serde_as};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{ErrorCategory, FleetError, FleetResult};

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant `base_delay`
    Fixed,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    #[default]
    Exponential,
    /// Exponential with ±`jitter_factor` random spread
    ExponentialJitter,
}

/// Retry configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay unit the strategies scale
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub base_delay: Duration,
    /// Maximum delay between attempts
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) for `exponential_jitter`
    pub jitter_factor: f64,
    /// Strategy used when none is given explicitly
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Retry statistics for one server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Retry attempts made, excluding first attempts
    pub total_retries: u64,
    /// Retried operations that eventually succeeded
    pub successful_retries: u64,
    /// Retried operations that still failed
    pub failed_retries: u64,
    /// Mean attempts per retried operation
    pub average_attempts: f64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: u64,
    retries: u64,
    successes: u64,
    failures: u64,
    attempts: u64,
}

/// Retry policy with per-server statistics
#[derive(Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
    stats: DashMap<String, Arc<Mutex<RetryCounters>>>,
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
        }
    }

    /// The policy's configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` with the configured attempts and strategy
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted or a non-retryable
    /// error occurs.
    pub async fn retry<F, Fut, T>(&self, id: &str, operation: F) -> FleetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        self.retry_with_backoff(id, self.config.max_attempts, self.config.strategy, operation)
            .await
    }

    /// Run `operation` up to `max_attempts` times, sleeping between attempts
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted or a non-retryable
    /// error occurs.
    pub async fn retry_with_backoff<F, Fut, T>(
        &self,
        id: &str,
        max_attempts: u32,
        strategy: BackoffStrategy,
        mut operation: F,
    ) -> FleetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FleetResult<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.record_retry(id, attempt, true);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= max_attempts || !Self::should_retry(&error) {
                        if attempt > 1 {
                            self.record_retry(id, attempt, false);
                        }
                        return Err(error);
                    }

                    let delay = self.delay_for(&error, attempt, strategy);
                    tracing::debug!(
                        server_id = %id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after failure"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Whether an error is worth retrying
    pub fn should_retry(error: &FleetError) -> bool {
        !error.is_rejection() && error.is_retryable()
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn calculate_backoff(&self, attempt: u32, strategy: BackoffStrategy) -> Duration {
        let attempt = attempt.max(1);
        let base = self.config.base_delay.as_secs_f64();

        let delay = match strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Exponential => base * 2f64.powi(attempt as i32 - 1),
            BackoffStrategy::ExponentialJitter => {
                let exponential = base * 2f64.powi(attempt as i32 - 1);
                let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * self.config.jitter_factor;
                exponential * jitter
            }
        };

        Duration::from_secs_f64(delay.clamp(0.0, self.config.max_delay.as_secs_f64()))
    }

    /// Backoff adjusted for the error: rate limits wait twice as long, or
    /// as long as the server asked if that is longer
    fn delay_for(&self, error: &FleetError, attempt: u32, strategy: BackoffStrategy) -> Duration {
        let delay = self.calculate_backoff(attempt, strategy);
        if error.category() != ErrorCategory::RateLimit {
            return delay;
        }
        let doubled = delay.saturating_mul(2).min(self.config.max_delay);
        error.retry_after().map_or(doubled, |hint| hint.max(doubled))
    }

    /// Record one finished operation that took `attempts` attempts
    pub fn record_retry(&self, id: &str, attempts: u32, success: bool) {
        let entry = self.stats.entry(id.to_string()).or_default().clone();
        let mut counters = entry.lock();
        counters.operations += 1;
        counters.retries += u64::from(attempts.saturating_sub(1));
        counters.attempts += u64::from(attempts);
        if success {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
    }

    /// Retry statistics for `id`
    pub fn get_retry_stats(&self, id: &str) -> RetryStats {
        let Some(entry) = self.stats.get(id).map(|e| e.clone()) else {
            return RetryStats::default();
        };
        let counters = entry.lock();
        RetryStats {
            total_retries: counters.retries,
            successful_retries: counters.successes,
            failed_retries: counters.failures,
            average_attempts: if counters.operations == 0 {
                0.0
            } else {
                counters.attempts as f64 / counters.operations as f64
            },
        }
    }

    /// Drop statistics for `id`
    pub fn remove(&self, id: &str) {
        self.stats.remove(id);
    }
}
