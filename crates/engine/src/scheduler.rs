//! Poll-cycle scheduling of ready keys onto the worker pool.
//!
//! One cycle ([`ProcessingScheduler::process`]) reads this instance's
//! partitions, asks the record store for ready keys, and hands each key to a
//! worker once the [`ProcessingLimiter`] admits it. A worker processes the
//! key's NEW records oldest first. Errors inside a key are contained there;
//! only coordinator or key-query failures abort the cycle.
//!
//! ```text
//! RUNNING --initiate_shutdown--> STOPPING --drained or timeout--> STOPPED
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use outpost_core::{Clock, RecordStatus};

use crate::coordinator::PartitionCoordinator;
use crate::limiter::{LimiterError, ProcessingLimiter};
use crate::pool::WorkerPool;
use crate::processor::{RecordOutcome, RecordProcessor};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("partition lookup failed: {0}")]
    Coordinator(StoreError),
    #[error("ready key query failed: {0}")]
    Store(StoreError),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    #[error("worker pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum keys fetched per cycle.
    pub batch_size: usize,
    /// Stop a key's remaining records after a failed or rescheduled one.
    pub stop_on_first_failure: bool,
    /// How long shutdown waits for in-flight keys.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stop_on_first_failure: true,
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Running,
    Stopping,
    Stopped,
}

/// Result of [`ProcessingScheduler::initiate_shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight key finished before the timeout.
    pub drained: bool,
    /// Keys still in flight when shutdown gave up waiting.
    pub unprocessed_keys: Vec<String>,
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub keys_dispatched: u64,
    pub records_completed: u64,
    pub records_retried: u64,
    pub records_failed: u64,
    pub key_errors: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    keys_dispatched: AtomicU64,
    records_completed: AtomicU64,
    records_retried: AtomicU64,
    records_failed: AtomicU64,
    key_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Completed | RecordOutcome::FallbackCompleted => {
                Self::bump(&self.records_completed)
            }
            RecordOutcome::RetryScheduled => Self::bump(&self.records_retried),
            RecordOutcome::Failed => Self::bump(&self.records_failed),
        }
    }
}

struct Shared {
    records: Arc<dyn RecordStore>,
    processor: Arc<RecordProcessor>,
    limiter: Arc<ProcessingLimiter>,
    clock: Arc<dyn Clock>,
    stop_on_first_failure: bool,
    counters: Counters,
}

impl Shared {
    fn process_key(&self, key: &str) {
        let records = match self.records.find_incomplete_records_by_key(key) {
            Ok(records) => records,
            Err(err) => {
                Counters::bump(&self.counters.key_errors);
                warn!(key, error = %err, "failed to load records for key");
                return;
            }
        };

        for mut record in records {
            if !record.can_be_retried(self.clock.now()) {
                continue;
            }
            match self.processor.process(&mut record) {
                Ok(outcome) => {
                    self.counters.record(outcome);
                    if outcome.is_failure() && self.stop_on_first_failure {
                        debug!(key, record_id = %record.id(), "stopping key after failure");
                        break;
                    }
                }
                Err(err) => {
                    Counters::bump(&self.counters.key_errors);
                    warn!(key, record_id = %record.id(), error = %err, "failed to persist record outcome");
                    return;
                }
            }
        }
    }
}

/// Releases a key's limiter slot when dropped, including during unwinding
/// or when the task never reaches a worker.
struct KeyPermit {
    limiter: Arc<ProcessingLimiter>,
    key: String,
}

impl Drop for KeyPermit {
    fn drop(&mut self) {
        if let Err(err) = self.limiter.release(&self.key) {
            error!(key = %self.key, error = %err, "failed to release key permit");
        }
    }
}

pub struct ProcessingScheduler {
    shared: Arc<Shared>,
    coordinator: Arc<PartitionCoordinator>,
    pool: WorkerPool,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Serializes dispatch; cycles never overlap.
    cycle: Mutex<()>,
}

impl ProcessingScheduler {
    /// Build a scheduler whose worker pool matches the limiter capacity.
    pub fn new(
        coordinator: Arc<PartitionCoordinator>,
        records: Arc<dyn RecordStore>,
        processor: Arc<RecordProcessor>,
        limiter: Arc<ProcessingLimiter>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let pool = WorkerPool::new("outpost-worker", limiter.capacity())
            .map_err(|e| SchedulerError::Pool(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                records,
                processor,
                limiter,
                clock,
                stop_on_first_failure: config.stop_on_first_failure,
                counters: Counters::default(),
            }),
            coordinator,
            pool,
            config,
            state: Mutex::new(SchedulerState::Running),
            cycle: Mutex::new(()),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Run one poll cycle. Returns the number of keys handed to workers.
    ///
    /// A no-op once shutdown has started.
    pub fn process(&self) -> Result<usize, SchedulerError> {
        if !self.is_running() {
            return Ok(0);
        }
        let _cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        Counters::bump(&self.shared.counters.cycles);

        let partitions = self
            .coordinator
            .get_assigned_partition_numbers()
            .map_err(SchedulerError::Coordinator)?;
        if partitions.is_empty() {
            debug!("no partitions assigned; skipping cycle");
            return Ok(0);
        }

        let keys = self
            .shared
            .records
            .find_ready_keys(
                &partitions,
                RecordStatus::New,
                self.config.batch_size,
                self.config.stop_on_first_failure,
                self.shared.clock.now(),
            )
            .map_err(SchedulerError::Store)?;

        let limiter = &self.shared.limiter;
        let mut dispatched = 0;
        for key in keys {
            if !self.is_running() {
                break;
            }
            // still running from an earlier cycle
            if limiter.is_in_flight(&key) {
                debug!(key = %key, "key already in flight; skipping");
                continue;
            }

            limiter.acquire(key.clone())?;
            let permit = KeyPermit {
                limiter: limiter.clone(),
                key,
            };
            if !self.is_running() {
                break;
            }

            let shared = self.shared.clone();
            let queued = self.pool.execute(move || {
                let permit = permit;
                shared.process_key(&permit.key);
            });
            if !queued {
                return Err(SchedulerError::Pool("worker pool is closed".to_string()));
            }
            Counters::bump(&self.shared.counters.keys_dispatched);
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(keys = dispatched, partitions = partitions.len(), "dispatched ready keys");
        }
        Ok(dispatched)
    }

    /// Wait until no key is in flight. Returns `false` on timeout.
    pub fn await_idle(&self, timeout: Duration) -> Result<bool, SchedulerError> {
        Ok(self.shared.limiter.await_all_timeout(timeout)?)
    }

    /// Stop dispatching and wait up to the configured timeout for in-flight
    /// keys. Safe to call more than once.
    pub fn initiate_shutdown(&self) -> ShutdownReport {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SchedulerState::Running {
                *state = SchedulerState::Stopping;
                info!(
                    in_flight = self.shared.limiter.in_flight_count(),
                    "scheduler stopping"
                );
            }
        }

        let drained = match self
            .shared
            .limiter
            .await_all_timeout(self.config.shutdown_timeout)
        {
            Ok(drained) => drained,
            Err(err) => {
                error!(error = %err, "failed waiting for in-flight keys");
                false
            }
        };
        let unprocessed_keys = self.shared.limiter.unprocessed_ids();
        self.pool.close();

        if drained {
            info!("scheduler stopped; all in-flight keys drained");
        } else {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                unprocessed = unprocessed_keys.len(),
                "shutdown timeout elapsed with keys still in flight"
            );
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Stopped;

        ShutdownReport {
            drained,
            unprocessed_keys,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            cycles: c.cycles.load(Ordering::Relaxed),
            keys_dispatched: c.keys_dispatched.load(Ordering::Relaxed),
            records_completed: c.records_completed.load(Ordering::Relaxed),
            records_retried: c.records_retried.load(Ordering::Relaxed),
            records_failed: c.records_failed.load(Ordering::Relaxed),
            key_errors: c.key_errors.load(Ordering::Relaxed),
            in_flight: self.shared.limiter.in_flight_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use chrono::{DateTime, Utc};
    use outpost_core::{
        InstanceId, ManualClock, OutboxRecord, PartitionAssignment, PartitionNumber, RecordId,
    };

    use crate::handler::{HandlerError, HandlerRegistry};
    use crate::instance_registry::{InstanceIdentity, InstanceRegistry};
    use crate::retry::{FixedDelayRetryPolicy, RetryPolicyRegistry};
    use crate::store::{
        InMemoryInstanceStore, InMemoryPartitionStore, InMemoryRecordStore, PartitionStore,
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        clock: Arc<ManualClock>,
        records: Arc<dyn RecordStore>,
        scheduler: ProcessingScheduler,
    }

    fn coordinator(
        partitions: Arc<dyn PartitionStore>,
        clock: Arc<ManualClock>,
    ) -> Arc<PartitionCoordinator> {
        let registry = Arc::new(InstanceRegistry::new(
            InstanceIdentity::new(InstanceId::from("node-a"), "localhost", 8080),
            InMemoryInstanceStore::arc(),
            clock.clone(),
            Duration::from_secs(30),
        ));
        registry.register_instance().unwrap();
        Arc::new(PartitionCoordinator::new(registry, partitions, clock))
    }

    fn harness_with(
        records: Arc<dyn RecordStore>,
        partitions: Arc<dyn PartitionStore>,
        handlers: HandlerRegistry,
        config: SchedulerConfig,
        capacity: usize,
    ) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let coordinator = coordinator(partitions, clock.clone());
        let _ = coordinator.rebalance();

        let handlers = Arc::new(handlers);
        let processor = Arc::new(RecordProcessor::new(
            records.clone(),
            handlers.clone(),
            handlers,
            Arc::new(RetryPolicyRegistry::new(Arc::new(FixedDelayRetryPolicy::no_retry()))),
            clock.clone(),
        ));
        let scheduler = ProcessingScheduler::new(
            coordinator,
            records.clone(),
            processor,
            Arc::new(ProcessingLimiter::new(capacity)),
            clock.clone(),
            config,
        )
        .unwrap();
        Harness {
            clock,
            records,
            scheduler,
        }
    }

    fn harness(handlers: HandlerRegistry, config: SchedulerConfig) -> Harness {
        harness_with(
            InMemoryRecordStore::arc(),
            InMemoryPartitionStore::arc(),
            handlers,
            config,
            4,
        )
    }

    impl Harness {
        fn schedule(&self, key: &str, action: &str) -> OutboxRecord {
            let record = OutboxRecord::builder()
                .key(key)
                .payload(serde_json::json!({ "action": action }))
                .handler_id("orders")
                .build(self.clock.as_ref())
                .unwrap();
            self.records.save(&record).unwrap();
            self.clock.advance(Duration::from_millis(1));
            record
        }

        fn run_cycle(&self) -> usize {
            let dispatched = self.scheduler.process().unwrap();
            assert!(self.scheduler.await_idle(WAIT).unwrap());
            dispatched
        }

        fn status_of(&self, record: &OutboxRecord) -> RecordStatus {
            self.records.find_by_id(record.id()).unwrap().unwrap().status()
        }
    }

    fn fail_on_demand(calls: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.register("orders", move |payload, _| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if payload["action"] == "fail" {
                Err(HandlerError::new("rejected", "told to fail"))
            } else {
                Ok(())
            }
        });
        handlers
    }

    #[test]
    fn stop_on_first_failure_halts_the_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(fail_on_demand(calls.clone()), SchedulerConfig::default());
        let first = h.schedule("order-1", "fail");
        let second = h.schedule("order-1", "ok");
        let third = h.schedule("order-1", "ok");

        assert_eq!(h.run_cycle(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.status_of(&first), RecordStatus::Failed);
        assert_eq!(h.status_of(&second), RecordStatus::New);
        assert_eq!(h.status_of(&third), RecordStatus::New);

        // the failed head keeps the key out of later cycles
        assert_eq!(h.run_cycle(), 0);
        assert_eq!(h.records.count_by_status(RecordStatus::Completed).unwrap(), 0);
        assert_eq!(h.records.count_by_status(RecordStatus::Failed).unwrap(), 1);
    }

    #[test]
    fn without_stop_on_failure_every_record_is_attempted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(
            fail_on_demand(calls.clone()),
            SchedulerConfig::default().with_stop_on_first_failure(false),
        );
        h.schedule("order-1", "fail");
        h.schedule("order-1", "ok");
        h.schedule("order-1", "ok");

        assert_eq!(h.run_cycle(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(h.records.count_by_status(RecordStatus::Completed).unwrap(), 2);
        assert_eq!(h.records.count_by_status(RecordStatus::Failed).unwrap(), 1);

        let stats = h.scheduler.stats();
        assert_eq!(stats.records_completed, 2);
        assert_eq!(stats.records_failed, 1);
        assert_eq!(stats.keys_dispatched, 1);
    }

    #[test]
    fn processes_many_keys_in_one_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(
            fail_on_demand(calls.clone()),
            SchedulerConfig::default().with_batch_size(50),
        );
        for i in 0..20 {
            h.schedule(&format!("customer-{i}"), "ok");
        }

        assert_eq!(h.run_cycle(), 20);
        assert_eq!(h.records.count_by_status(RecordStatus::Completed).unwrap(), 20);
        assert_eq!(h.records.count_by_status(RecordStatus::New).unwrap(), 0);
    }

    #[test]
    fn not_yet_due_records_are_left_for_later() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(fail_on_demand(calls.clone()), SchedulerConfig::default());
        let record = OutboxRecord::builder()
            .key("order-9")
            .payload(serde_json::json!({ "action": "ok" }))
            .handler_id("orders")
            .build(h.clock.as_ref())
            .unwrap();
        h.records.save(&record).unwrap();

        // created_at == now: not due yet
        assert_eq!(h.run_cycle(), 0);
        h.clock.advance(Duration::from_millis(1));
        assert_eq!(h.run_cycle(), 1);
        assert_eq!(h.status_of(&record), RecordStatus::Completed);
    }

    #[test]
    fn a_not_yet_due_record_mid_key_is_skipped_on_its_own() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(fail_on_demand(calls.clone()), SchedulerConfig::default());
        let first = h.schedule("order-3", "ok");
        let mut second = h.schedule("order-3", "ok");
        let third = h.schedule("order-3", "ok");

        second.schedule_next_retry(Duration::from_secs(60), h.clock.now());
        h.records.save(&second).unwrap();

        assert_eq!(h.run_cycle(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(h.status_of(&first), RecordStatus::Completed);
        assert_eq!(h.status_of(&second), RecordStatus::New);
        assert_eq!(h.status_of(&third), RecordStatus::Completed);
    }

    /// Counts key queries so a test can prove none happened.
    #[derive(Default)]
    struct CountingRecordStore {
        inner: InMemoryRecordStore,
        ready_key_queries: AtomicUsize,
    }

    impl RecordStore for CountingRecordStore {
        fn save(&self, record: &OutboxRecord) -> Result<(), StoreError> {
            self.inner.save(record)
        }
        fn find_by_id(&self, id: &RecordId) -> Result<Option<OutboxRecord>, StoreError> {
            self.inner.find_by_id(id)
        }
        fn delete_by_id(&self, id: &RecordId) -> Result<bool, StoreError> {
            self.inner.delete_by_id(id)
        }
        fn find_ready_keys(
            &self,
            partitions: &[PartitionNumber],
            status: RecordStatus,
            batch_size: usize,
            exclude_prior_failure: bool,
            now: DateTime<Utc>,
        ) -> Result<Vec<String>, StoreError> {
            self.ready_key_queries
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner
                .find_ready_keys(partitions, status, batch_size, exclude_prior_failure, now)
        }
        fn find_incomplete_records_by_key(&self, key: &str) -> Result<Vec<OutboxRecord>, StoreError> {
            self.inner.find_incomplete_records_by_key(key)
        }
        fn count_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
            self.inner.count_by_status(status)
        }
        fn find_by_status(&self, status: RecordStatus, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
            self.inner.find_by_status(status, limit)
        }
        fn delete_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
            self.inner.delete_by_status(status)
        }
    }

    /// Partition store with a table that is never empty and never owned by us.
    struct ForeignPartitionStore;

    impl PartitionStore for ForeignPartitionStore {
        fn find_all(&self) -> Result<Vec<PartitionAssignment>, StoreError> {
            Ok(vec![PartitionAssignment::owned(
                0,
                InstanceId::from("node-z"),
                Utc::now(),
            )])
        }
        fn find_by_instance_id(
            &self,
            _instance_id: &InstanceId,
        ) -> Result<Vec<PartitionAssignment>, StoreError> {
            Ok(Vec::new())
        }
        fn claim_all_partitions(&self, _: &InstanceId, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn release_partitions(&self, _: &[PartitionNumber], _: &InstanceId) -> Result<(), StoreError> {
            Ok(())
        }
        fn claim_stale_partitions(
            &self,
            _: &[PartitionNumber],
            _: Option<&BTreeSet<InstanceId>>,
            _: &InstanceId,
            _: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Conflict("partition 0".to_string()))
        }
    }

    /// Partition store whose reads always fail.
    struct UnavailablePartitionStore;

    impl PartitionStore for UnavailablePartitionStore {
        fn find_all(&self) -> Result<Vec<PartitionAssignment>, StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
        fn find_by_instance_id(
            &self,
            _instance_id: &InstanceId,
        ) -> Result<Vec<PartitionAssignment>, StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
        fn claim_all_partitions(&self, _: &InstanceId, _: DateTime<Utc>) -> Result<bool, StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
        fn release_partitions(&self, _: &[PartitionNumber], _: &InstanceId) -> Result<(), StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
        fn claim_stale_partitions(
            &self,
            _: &[PartitionNumber],
            _: Option<&BTreeSet<InstanceId>>,
            _: &InstanceId,
            _: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
    }

    #[test]
    fn no_partitions_means_no_record_query() {
        let records = Arc::new(CountingRecordStore::default());
        let h = harness_with(
            records.clone(),
            Arc::new(ForeignPartitionStore),
            HandlerRegistry::new(),
            SchedulerConfig::default(),
            2,
        );
        h.schedule("order-1", "ok");

        assert_eq!(h.scheduler.process().unwrap(), 0);
        assert_eq!(
            records.ready_key_queries.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn coordinator_failure_aborts_the_cycle() {
        let records = Arc::new(CountingRecordStore::default());
        let h = harness_with(
            records.clone(),
            Arc::new(UnavailablePartitionStore),
            HandlerRegistry::new(),
            SchedulerConfig::default(),
            2,
        );

        let err = h.scheduler.process().unwrap_err();
        assert!(matches!(err, SchedulerError::Coordinator(StoreError::Storage(_))));
        assert_eq!(
            records.ready_key_queries.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    /// Fails to load records for one poisoned key.
    #[derive(Default)]
    struct FlakyRecordStore {
        inner: InMemoryRecordStore,
    }

    impl RecordStore for FlakyRecordStore {
        fn save(&self, record: &OutboxRecord) -> Result<(), StoreError> {
            self.inner.save(record)
        }
        fn find_by_id(&self, id: &RecordId) -> Result<Option<OutboxRecord>, StoreError> {
            self.inner.find_by_id(id)
        }
        fn delete_by_id(&self, id: &RecordId) -> Result<bool, StoreError> {
            self.inner.delete_by_id(id)
        }
        fn find_ready_keys(
            &self,
            partitions: &[PartitionNumber],
            status: RecordStatus,
            batch_size: usize,
            exclude_prior_failure: bool,
            now: DateTime<Utc>,
        ) -> Result<Vec<String>, StoreError> {
            self.inner
                .find_ready_keys(partitions, status, batch_size, exclude_prior_failure, now)
        }
        fn find_incomplete_records_by_key(&self, key: &str) -> Result<Vec<OutboxRecord>, StoreError> {
            if key == "poisoned" {
                return Err(StoreError::Storage("row decode failed".to_string()));
            }
            self.inner.find_incomplete_records_by_key(key)
        }
        fn count_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
            self.inner.count_by_status(status)
        }
        fn find_by_status(&self, status: RecordStatus, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
            self.inner.find_by_status(status, limit)
        }
        fn delete_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
            self.inner.delete_by_status(status)
        }
    }

    #[test]
    fn key_errors_are_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness_with(
            Arc::new(FlakyRecordStore::default()),
            InMemoryPartitionStore::arc(),
            fail_on_demand(calls.clone()),
            SchedulerConfig::default(),
            2,
        );
        let poisoned = h.schedule("poisoned", "ok");
        let healthy = h.schedule("healthy", "ok");

        assert_eq!(h.run_cycle(), 2);
        assert_eq!(h.status_of(&poisoned), RecordStatus::New);
        assert_eq!(h.status_of(&healthy), RecordStatus::Completed);
        assert_eq!(h.scheduler.stats().key_errors, 1);
        assert_eq!(h.scheduler.stats().in_flight, 0);
    }

    #[test]
    fn panicking_handler_still_releases_the_key() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("orders", |_, _| panic!("handler bug"));
        let h = harness(handlers, SchedulerConfig::default());
        h.schedule("order-1", "ok");

        assert_eq!(h.run_cycle(), 1);
        assert_eq!(h.scheduler.stats().in_flight, 0);
    }

    #[test]
    fn shutdown_drains_in_flight_keys_then_stops() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let mut handlers = HandlerRegistry::new();
        handlers.register("orders", move |_, _| {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
            Ok(())
        });
        let h = harness(handlers, SchedulerConfig::default().with_shutdown_timeout(WAIT));
        let record = h.schedule("order-1", "ok");

        assert_eq!(h.scheduler.process().unwrap(), 1);
        started_rx.recv_timeout(WAIT).unwrap();

        std::thread::scope(|s| {
            let shutdown = s.spawn(|| h.scheduler.initiate_shutdown());
            std::thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
            let report = shutdown.join().unwrap();
            assert!(report.drained);
            assert!(report.unprocessed_keys.is_empty());
        });

        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        assert_eq!(h.status_of(&record), RecordStatus::Completed);

        // later cycles are no-ops
        h.schedule("order-2", "ok");
        assert_eq!(h.scheduler.process().unwrap(), 0);
    }

    #[test]
    fn shutdown_timeout_reports_unprocessed_keys() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let mut handlers = HandlerRegistry::new();
        handlers.register("orders", move |_, _| {
            let _ = release_rx.lock().unwrap().recv();
            Ok(())
        });
        let h = harness(
            handlers,
            SchedulerConfig::default().with_shutdown_timeout(Duration::from_millis(50)),
        );
        h.schedule("order-1", "ok");

        assert_eq!(h.scheduler.process().unwrap(), 1);
        let report = h.scheduler.initiate_shutdown();
        assert!(!report.drained);
        assert_eq!(report.unprocessed_keys, vec!["order-1".to_string()]);
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        release_tx.send(()).unwrap();
        assert!(h.scheduler.await_idle(WAIT).unwrap());
    }
}
