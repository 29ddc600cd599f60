//! Backoff algorithms.

use std::time::Duration;

use crate::handler::HandlerError;

use super::{RetryFilter, RetryPolicy};

/// Constant delay between attempts.
#[derive(Debug, Clone)]
pub struct FixedDelayRetryPolicy {
    delay: Duration,
    max_retries: u32,
    filter: RetryFilter,
}

impl FixedDelayRetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self {
            delay,
            max_retries,
            filter: RetryFilter::all(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn with_filter(mut self, filter: RetryFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl RetryPolicy for FixedDelayRetryPolicy {
    fn should_retry(&self, error: &HandlerError) -> bool {
        self.filter.allows(error)
    }

    fn next_delay(&self, _failure_count: u32) -> Duration {
        self.delay
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Geometric growth: `initial * multiplier^(failures - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetryPolicy {
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    max_retries: u32,
    filter: RetryFilter,
}

impl ExponentialBackoffRetryPolicy {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            multiplier: multiplier.max(1.0),
            max_delay,
            max_retries,
            filter: RetryFilter::all(),
        }
    }

    pub fn with_filter(mut self, filter: RetryFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn should_retry(&self, error: &HandlerError) -> bool {
        self.filter.allows(error)
    }

    fn next_delay(&self, failure_count: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = failure_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ns = self.initial_delay.as_nanos() as f64;
        let max_ns = self.max_delay.as_nanos() as f64;

        let delay_ns = (initial_ns * self.multiplier.powi(exponent)).min(max_ns);
        Duration::from_nanos(delay_ns.max(0.0).round() as u64)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Linear growth: `initial + increment * (failures - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct LinearBackoffRetryPolicy {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
    max_retries: u32,
    filter: RetryFilter,
}

impl LinearBackoffRetryPolicy {
    pub fn new(initial_delay: Duration, increment: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            increment,
            max_delay,
            max_retries,
            filter: RetryFilter::all(),
        }
    }

    pub fn with_filter(mut self, filter: RetryFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl RetryPolicy for LinearBackoffRetryPolicy {
    fn should_retry(&self, error: &HandlerError) -> bool {
        self.filter.allows(error)
    }

    fn next_delay(&self, failure_count: u32) -> Duration {
        let steps = failure_count.saturating_sub(1);
        self.increment
            .checked_mul(steps)
            .and_then(|grown| self.initial_delay.checked_add(grown))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
