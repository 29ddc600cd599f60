//! Single-record delivery: dispatch, then resolve the outcome.

use std::sync::Arc;

use tracing::{debug, info, warn};

use outpost_core::{Clock, OutboxRecord};

use crate::handler::{FailureContext, FallbackInvoker, HandlerError, HandlerInvoker, HandlerMetadata};
use crate::retry::RetryPolicyRegistry;
use crate::store::{RecordStore, StoreError};

/// How a processing attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Handler succeeded.
    Completed,
    /// Handler failed; the record stays NEW with a later `next_retry_at`.
    RetryScheduled,
    /// Handler failed for good and the fallback handled the record.
    FallbackCompleted,
    /// Handler failed for good and no fallback resolved it.
    Failed,
}

impl RecordOutcome {
    /// Whether the record reached a terminal status this attempt.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::RetryScheduled)
    }

    /// Failed this attempt (rescheduled or terminally failed).
    pub fn is_failure(self) -> bool {
        matches!(self, Self::RetryScheduled | Self::Failed)
    }
}

pub struct RecordProcessor {
    store: Arc<dyn RecordStore>,
    handlers: Arc<dyn HandlerInvoker>,
    fallbacks: Arc<dyn FallbackInvoker>,
    policies: Arc<RetryPolicyRegistry>,
    clock: Arc<dyn Clock>,
    delete_completed: bool,
}

impl RecordProcessor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        handlers: Arc<dyn HandlerInvoker>,
        fallbacks: Arc<dyn FallbackInvoker>,
        policies: Arc<RetryPolicyRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            handlers,
            fallbacks,
            policies,
            clock,
            delete_completed: false,
        }
    }

    /// Delete records once completed instead of keeping them as COMPLETED.
    pub fn with_delete_completed(mut self, delete_completed: bool) -> Self {
        self.delete_completed = delete_completed;
        self
    }

    /// Returns `true` when the record was resolved (completed or failed),
    /// `false` when a retry was scheduled.
    pub fn process_record(&self, record: &mut OutboxRecord) -> Result<bool, StoreError> {
        self.process(record).map(RecordOutcome::is_resolved)
    }

    pub fn process(&self, record: &mut OutboxRecord) -> Result<RecordOutcome, StoreError> {
        let metadata = HandlerMetadata::for_record(record);

        let error = match self.handlers.dispatch(record.payload(), &metadata) {
            Ok(()) => {
                self.complete(record)?;
                debug!(record_id = %record.id(), key = %record.key(), "record completed");
                return Ok(RecordOutcome::Completed);
            }
            Err(error) => error,
        };

        record.increment_failure_count();
        record.record_failure_reason(error.to_string());

        let policy = self.policies.resolve(record.handler_id());
        let retries_exhausted = record.retries_exhausted(policy.max_retries());
        let non_retryable = !policy.should_retry(&error);

        if !retries_exhausted && !non_retryable {
            let now = self.clock.now();
            let delay = policy.next_delay(record.failure_count());
            record.schedule_next_retry(delay, now);
            self.store.save(record)?;
            warn!(
                record_id = %record.id(),
                key = %record.key(),
                handler_id = %record.handler_id(),
                failure_count = record.failure_count(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "record processing failed; retry scheduled"
            );
            return Ok(RecordOutcome::RetryScheduled);
        }

        let failure = FailureContext {
            record_id: record.id().clone(),
            key: record.key().to_string(),
            handler_id: record.handler_id().to_string(),
            failure_count: record.failure_count(),
            last_error: error,
            retries_exhausted,
            non_retryable,
            created_at: record.created_at(),
        };
        self.run_fallback(record, &metadata, &failure)
    }

    fn run_fallback(
        &self,
        record: &mut OutboxRecord,
        metadata: &HandlerMetadata,
        failure: &FailureContext,
    ) -> Result<RecordOutcome, StoreError> {
        match self.fallbacks.dispatch(record.payload(), metadata, failure) {
            Ok(true) => {
                self.complete(record)?;
                info!(
                    record_id = %record.id(),
                    key = %record.key(),
                    failure_count = failure.failure_count,
                    "record resolved by fallback"
                );
                Ok(RecordOutcome::FallbackCompleted)
            }
            Ok(false) => self.fail(record, failure, None),
            Err(fallback_error) => self.fail(record, failure, Some(fallback_error)),
        }
    }

    fn fail(
        &self,
        record: &mut OutboxRecord,
        failure: &FailureContext,
        fallback_error: Option<HandlerError>,
    ) -> Result<RecordOutcome, StoreError> {
        record.mark_failed();
        self.store.save(record)?;
        warn!(
            record_id = %record.id(),
            key = %record.key(),
            handler_id = %record.handler_id(),
            failure_count = failure.failure_count,
            retries_exhausted = failure.retries_exhausted,
            non_retryable = failure.non_retryable,
            error = %failure.last_error,
            fallback_error = ?fallback_error,
            "record failed permanently"
        );
        Ok(RecordOutcome::Failed)
    }

    fn complete(&self, record: &mut OutboxRecord) -> Result<(), StoreError> {
        record.mark_completed(self.clock.now());
        if self.delete_completed {
            self.store.delete_by_id(record.id())?;
        } else {
            self.store.save(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use outpost_core::{ManualClock, RecordStatus};

    use crate::handler::HandlerRegistry;
    use crate::retry::{FixedDelayRetryPolicy, RetryFilter, RetryPolicy};
    use crate::store::InMemoryRecordStore;

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryRecordStore::arc(),
                clock: Arc::new(ManualClock::default()),
            }
        }

        fn processor(&self, registry: HandlerRegistry, policy: impl RetryPolicy + 'static) -> RecordProcessor {
            let registry = Arc::new(registry);
            RecordProcessor::new(
                self.store.clone(),
                registry.clone(),
                registry,
                Arc::new(RetryPolicyRegistry::new(Arc::new(policy))),
                self.clock.clone(),
            )
        }

        fn record(&self) -> OutboxRecord {
            let record = OutboxRecord::builder()
                .key("order-1")
                .payload(serde_json::json!({"amount": 10}))
                .handler_id("orders")
                .build(self.clock.as_ref())
                .unwrap();
            self.store.save(&record).unwrap();
            record
        }
    }

    fn failing(registry: &mut HandlerRegistry, calls: Arc<AtomicUsize>) {
        registry.register("orders", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("timeout", "downstream timed out"))
        });
    }

    #[test]
    fn success_marks_completed() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("orders", |payload, meta| {
            assert_eq!(payload["amount"], 10);
            assert_eq!(meta.key, "order-1");
            Ok(())
        });
        let processor = fx.processor(registry, FixedDelayRetryPolicy::no_retry());

        let mut record = fx.record();
        assert_eq!(processor.process(&mut record).unwrap(), RecordOutcome::Completed);

        let stored = fx.store.find_by_id(record.id()).unwrap().unwrap();
        assert_eq!(stored.status(), RecordStatus::Completed);
        assert_eq!(stored.completed_at(), Some(fx.clock.now()));
    }

    #[test]
    fn completed_records_can_be_deleted() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register("orders", |_, _| Ok(()));
        let processor = fx
            .processor(registry, FixedDelayRetryPolicy::no_retry())
            .with_delete_completed(true);

        let mut record = fx.record();
        assert!(processor.process_record(&mut record).unwrap());
        assert!(fx.store.find_by_id(record.id()).unwrap().is_none());
    }

    #[test]
    fn fixed_delay_reschedules_and_keeps_new() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        failing(&mut registry, Arc::new(AtomicUsize::new(0)));
        let processor = fx.processor(registry, FixedDelayRetryPolicy::new(Duration::from_secs(10), 3));

        let mut record = fx.record();
        assert!(!processor.process_record(&mut record).unwrap());

        let stored = fx.store.find_by_id(record.id()).unwrap().unwrap();
        assert_eq!(stored.status(), RecordStatus::New);
        assert_eq!(stored.failure_count(), 1);
        assert_eq!(
            stored.next_retry_at(),
            fx.clock.now() + chrono::Duration::seconds(10)
        );
        assert_eq!(stored.failure_reason(), Some("timeout: downstream timed out"));
    }

    #[test]
    fn exhausted_retries_run_fallback_once() {
        let fx = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        failing(&mut registry, calls.clone());
        let seen = fallback_calls.clone();
        registry.register_fallback("orders", move |_, _, ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.failure_count, 3);
            assert!(ctx.retries_exhausted);
            assert!(!ctx.non_retryable);
            Ok(())
        });
        let processor = fx.processor(registry, FixedDelayRetryPolicy::new(Duration::from_secs(1), 2));

        let mut record = fx.record();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(processor.process(&mut record).unwrap());
            fx.clock.advance(Duration::from_secs(2));
        }

        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::RetryScheduled,
                RecordOutcome::RetryScheduled,
                RecordOutcome::FallbackCompleted,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        let stored = fx.store.find_by_id(record.id()).unwrap().unwrap();
        assert_eq!(stored.status(), RecordStatus::Completed);
    }

    #[test]
    fn failing_fallback_marks_failed() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        failing(&mut registry, Arc::new(AtomicUsize::new(0)));
        registry.register_fallback("orders", |_, _, _| Err(HandlerError::new("dlq", "unavailable")));
        let processor = fx.processor(registry, FixedDelayRetryPolicy::no_retry());

        let mut record = fx.record();
        assert_eq!(processor.process(&mut record).unwrap(), RecordOutcome::Failed);

        let stored = fx.store.find_by_id(record.id()).unwrap().unwrap();
        assert_eq!(stored.status(), RecordStatus::Failed);
        assert_eq!(stored.failure_reason(), Some("timeout: downstream timed out"));
    }

    #[test]
    fn missing_fallback_marks_failed() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        failing(&mut registry, Arc::new(AtomicUsize::new(0)));
        let processor = fx.processor(registry, FixedDelayRetryPolicy::no_retry());

        let mut record = fx.record();
        assert!(processor.process_record(&mut record).unwrap());
        assert_eq!(record.status(), RecordStatus::Failed);
    }

    #[test]
    fn non_retryable_error_skips_straight_to_fallback() {
        let fx = Fixture::new();
        let contexts: Arc<Mutex<Vec<FailureContext>>> = Arc::default();

        let mut registry = HandlerRegistry::new();
        registry.register("orders", |_, _| Err(HandlerError::new("validation", "bad amount")));
        let sink = contexts.clone();
        registry.register_fallback("orders", move |_, _, ctx| {
            sink.lock().unwrap().push(ctx.clone());
            Ok(())
        });
        let policy = FixedDelayRetryPolicy::new(Duration::from_secs(1), 5)
            .with_filter(RetryFilter::all().no_retry_on("validation"));
        let processor = fx.processor(registry, policy);

        let mut record = fx.record();
        assert_eq!(
            processor.process(&mut record).unwrap(),
            RecordOutcome::FallbackCompleted
        );

        let contexts = contexts.lock().unwrap();
        assert_eq!(contexts.len(), 1);
        let ctx = &contexts[0];
        assert_eq!(&ctx.record_id, record.id());
        assert_eq!(ctx.key, "order-1");
        assert_eq!(ctx.handler_id, "orders");
        assert_eq!(ctx.failure_count, 1);
        assert_eq!(ctx.last_error.kind(), "validation");
        assert!(!ctx.retries_exhausted);
        assert!(ctx.non_retryable);
        assert_eq!(ctx.created_at, record.created_at());
    }

    #[test]
    fn unknown_handler_fails_without_retry_budget() {
        let fx = Fixture::new();
        let processor = fx.processor(HandlerRegistry::new(), FixedDelayRetryPolicy::no_retry());

        let mut record = fx.record();
        assert_eq!(processor.process(&mut record).unwrap(), RecordOutcome::Failed);
        assert!(record
            .failure_reason()
            .is_some_and(|r| r.starts_with(HandlerError::HANDLER_NOT_FOUND)));
    }
}
