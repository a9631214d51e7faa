use std::fmt::Display;
use std::time::Duration;

// ============================================================================
// Retry Strategies
// ============================================================================
//
// A strategy is a single-use, stateful policy: the repository consults it
// once per failed pipeline attempt and the strategy decides whether the
// whole load -> operate -> seal -> save cycle runs again, and after what
// delay. Strategies carry their own counters, so one instance must not be
// shared between unrelated operations unless shared backoff pacing is
// explicitly desired. Taking the strategy by value into the repository
// call makes that the default.
//
// ============================================================================

/// Classifies an error as transient (worth retrying) or permanent.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("retry limit reached after {retries} retries: {last_error}")]
    LimitReached { retries: u32, last_error: String },
}

/// Outcome of consulting a strategy about a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Re-run the whole pipeline after waiting for the delay.
    RetryAfter(Duration),
    /// Give up, propagating the original error unchanged.
    Propagate,
    /// Give up with a terminal strategy error.
    Fail(RetryError),
}

/// Pluggable retry policy, consulted once per failed pipeline attempt.
pub trait RetryStrategy<E>: Send {
    fn decide(&mut self, error: &E) -> RetryDecision;
}

/// Default policy: fail on the first error, propagating it unchanged.
pub struct NoRetry;

impl<E> RetryStrategy<E> for NoRetry {
    fn decide(&mut self, _error: &E) -> RetryDecision {
        RetryDecision::Propagate
    }
}

/// Tuning parameters for [`ExponentialBackoff`].
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every retry.
    pub factor: f64,
    /// Upper bound for the delay.
    pub maximum_delay: Duration,
    /// Retry budget; `None` means unbounded.
    pub maximum_retries: Option<u32>,
    /// Jitter fraction: each new delay is additionally multiplied by
    /// `1 + random() * random_factor` when non-zero.
    pub random_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(16),
            factor: 2.0,
            maximum_delay: Duration::from_millis(120_000),
            maximum_retries: None,
            random_factor: 0.0,
        }
    }
}

/// Exponential backoff with optional jitter and retry budget.
///
/// Only transient errors are retried; permanent errors propagate unchanged
/// so that a schema mismatch or a domain rejection is never spun on.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    retries_so_far: u32,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            retries_so_far: 0,
            current_delay,
        }
    }

    pub fn retries_so_far(&self) -> u32 {
        self.retries_so_far
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl<E> RetryStrategy<E> for ExponentialBackoff
where
    E: IsTransient + Display,
{
    fn decide(&mut self, error: &E) -> RetryDecision {
        if let Some(maximum) = self.config.maximum_retries {
            if self.retries_so_far >= maximum {
                return RetryDecision::Fail(RetryError::LimitReached {
                    retries: self.retries_so_far,
                    last_error: error.to_string(),
                });
            }
        }
        if !error.is_transient() {
            return RetryDecision::Propagate;
        }

        let delay = self.current_delay;

        // Grow the delay for the next round: multiply, jitter, clamp.
        let mut next = self.current_delay.as_secs_f64() * self.config.factor;
        if self.config.random_factor != 0.0 {
            next *= 1.0 + rand::random::<f64>() * self.config.random_factor;
        }
        self.current_delay = Duration::from_secs_f64(next).min(self.config.maximum_delay);
        self.retries_so_far += 1;

        tracing::debug!(
            retries_so_far = self.retries_so_far,
            delay_ms = delay.as_millis() as u64,
            "scheduling pipeline retry"
        );
        RetryDecision::RetryAfter(delay)
    }
}

// ============================================================================
// Tests
// ============================================================================
