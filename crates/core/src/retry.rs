//! Retry and backoff utilities for container runtime operations
//!
//! This module provides configurable retry mechanisms with exponential backoff
//! and jitter. Every loop is bounded: by an attempt count, by an elapsed-time
//! budget, or both. Nothing is retried forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Jitter strategy for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JitterStrategy {
    /// Full jitter: random delay between 0 and calculated delay
    #[default]
    FullJitter,
    /// Equal jitter: half calculated delay plus random half
    EqualJitter,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter strategy to apply
    pub jitter: JitterStrategy,
    /// Total time budget across all attempts; `None` means attempts alone bound the loop
    #[serde(default)]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: JitterStrategy::default(),
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with specified parameters
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: JitterStrategy,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
            max_elapsed: None,
        }
    }

    /// Backoff bounded only by elapsed time, with a randomized starting interval.
    ///
    /// The starting interval is drawn from `[min_base, max_base]` so that several
    /// processes racing on the same resource do not poll in lockstep.
    pub fn randomized(
        min_base: Duration,
        max_base: Duration,
        max_delay: Duration,
        budget: Duration,
    ) -> Self {
        let lo = min_base.as_millis() as u64;
        let hi = (max_base.as_millis() as u64).max(lo);
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(fastrand::u64(lo..=hi)),
            max_delay,
            jitter: JitterStrategy::EqualJitter,
            max_elapsed: Some(budget),
        }
    }

    /// Set the total time budget
    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    /// Calculate delay for a given attempt number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.capped_delay(attempt))
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        // Exponential backoff: base_delay * 2^attempt
        let exponential_delay = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt));

        let capped_delay = exponential_delay.min(self.max_delay.as_millis());
        Duration::from_millis(capped_delay as u64)
    }

    /// Apply jitter to the calculated delay
    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterStrategy::FullJitter => {
                let jitter_ms = fastrand::u64(0..=delay.as_millis() as u64);
                Duration::from_millis(jitter_ms)
            }
            JitterStrategy::EqualJitter => {
                let half_delay = delay.as_millis() as u64 / 2;
                let jitter_ms = half_delay + fastrand::u64(0..=half_delay);
                Duration::from_millis(jitter_ms)
            }
        }
    }

    /// Apply jitter with seeded RNG for deterministic testing
    #[cfg(test)]
    fn apply_jitter_seeded(&self, delay: Duration, seed: u64) -> Duration {
        let mut rng = fastrand::Rng::with_seed(seed);
        match self.jitter {
            JitterStrategy::FullJitter => {
                let jitter_ms = rng.u64(0..=delay.as_millis() as u64);
                Duration::from_millis(jitter_ms)
            }
            JitterStrategy::EqualJitter => {
                let half_delay = delay.as_millis() as u64 / 2;
                let jitter_ms = half_delay + rng.u64(0..=half_delay);
                Duration::from_millis(jitter_ms)
            }
        }
    }

    /// Calculate delay with seeded RNG for testing
    #[cfg(test)]
    pub fn calculate_delay_seeded(&self, attempt: u32, seed: u64) -> Duration {
        self.apply_jitter_seeded(self.capped_delay(attempt), seed)
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Do not retry (terminal error)
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Default error classifier that retries on all errors
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation with exponential backoff and jitter
///
/// Stops when the operation succeeds, when the classifier says `Stop`, when the
/// attempts are used up, or when the next sleep would overrun `max_elapsed`.
/// The last error is returned in every failure case.
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    mut operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        debug!("Retry attempt {}", attempt);

        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        debug!("Operation failed on attempt {}: {:?}", attempt, error);

        if classify_error(&error) == RetryDecision::Stop {
            debug!("Error classifier indicated stop, not retrying");
            return Err(error);
        }

        if attempt >= config.max_attempts {
            warn!(
                "All {} retry attempts exhausted, final error: {:?}",
                attempt.saturating_add(1),
                error
            );
            return Err(error);
        }

        let delay = config.calculate_delay(attempt);
        if let Some(budget) = config.max_elapsed {
            if started.elapsed() + delay > budget {
                warn!(
                    "Retry budget of {:?} exhausted after {} attempts, final error: {:?}",
                    budget,
                    attempt.saturating_add(1),
                    error
                );
                return Err(error);
            }
        }

        debug!("Sleeping for {:?} before next attempt", delay);
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}
