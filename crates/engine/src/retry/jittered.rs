use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::handler::HandlerError;

use super::RetryPolicy;

/// Adds uniform random jitter in `[0, jitter]` to a base policy's delay.
///
/// Spreads retries of records that failed together so they do not all come
/// due on the same poll.
#[derive(Debug, Clone)]
pub struct JitteredRetryPolicy {
    base: Arc<dyn RetryPolicy>,
    jitter: Duration,
}

impl JitteredRetryPolicy {
    pub fn new(base: Arc<dyn RetryPolicy>, jitter: Duration) -> Self {
        Self { base, jitter }
    }
}

impl RetryPolicy for JitteredRetryPolicy {
    fn should_retry(&self, error: &HandlerError) -> bool {
        self.base.should_retry(error)
    }

    fn next_delay(&self, failure_count: u32) -> Duration {
        let base = self.base.next_delay(failure_count);
        let jitter_ns = self.jitter.as_nanos().min(u64::MAX as u128) as u64;
        if jitter_ns == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ns);
        base.saturating_add(Duration::from_nanos(extra))
    }

    fn max_retries(&self) -> u32 {
        self.base.max_retries()
    }
}
