//! Retry policies: when to retry a failed record and how long to wait.
//!
//! ## Components
//!
//! - [`RetryPolicy`]: eligibility + delay contract, consulted once per failure
//! - [`FixedDelayRetryPolicy`], [`ExponentialBackoffRetryPolicy`],
//!   [`LinearBackoffRetryPolicy`]: backoff algorithms
//! - [`JitteredRetryPolicy`]: adds bounded random jitter to any policy
//! - [`RetryPolicyRegistry`]: per-handler policy resolution

pub mod backoff;
pub mod jittered;
pub mod registry;

pub use backoff::{ExponentialBackoffRetryPolicy, FixedDelayRetryPolicy, LinearBackoffRetryPolicy};
pub use jittered::JitteredRetryPolicy;
pub use registry::RetryPolicyRegistry;

use std::sync::Arc;
use std::time::Duration;

use crate::handler::HandlerError;

pub trait RetryPolicy: Send + Sync + core::fmt::Debug {
    /// Whether `error` is transient and worth another attempt.
    fn should_retry(&self, error: &HandlerError) -> bool;

    /// Delay before the next attempt, given the failure count so far (1 after
    /// the first failure).
    fn next_delay(&self, failure_count: u32) -> Duration;

    /// Number of retries after the initial attempt.
    fn max_retries(&self) -> u32;
}

impl<P> RetryPolicy for Arc<P>
where
    P: RetryPolicy + ?Sized,
{
    fn should_retry(&self, error: &HandlerError) -> bool {
        (**self).should_retry(error)
    }

    fn next_delay(&self, failure_count: u32) -> Duration {
        (**self).next_delay(failure_count)
    }

    fn max_retries(&self) -> u32 {
        (**self).max_retries()
    }
}

/// Error-kind filter deciding retryability.
///
/// `no_retry_on` wins over `retry_on`; an empty `retry_on` means every kind
/// not explicitly excluded is retried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryFilter {
    retry_on: Vec<String>,
    no_retry_on: Vec<String>,
}

impl RetryFilter {
    /// Retry every error kind.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    pub fn no_retry_on(mut self, kind: impl Into<String>) -> Self {
        self.no_retry_on.push(kind.into());
        self
    }

    pub fn allows(&self, error: &HandlerError) -> bool {
        if self.no_retry_on.iter().any(|k| k == error.kind()) {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.iter().any(|k| k == error.kind())
    }
}
