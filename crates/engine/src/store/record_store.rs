//! Outbox record storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use outpost_core::{OutboxRecord, PartitionNumber, RecordId, RecordStatus};

use super::StoreError;

/// Record store abstraction.
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record.
    fn save(&self, record: &OutboxRecord) -> Result<(), StoreError>;

    fn find_by_id(&self, id: &RecordId) -> Result<Option<OutboxRecord>, StoreError>;

    /// Delete a record. Returns whether it existed.
    fn delete_by_id(&self, id: &RecordId) -> Result<bool, StoreError>;

    /// Distinct keys inside `partitions` with at least one `status` record due
    /// before `now`, ordered by that record's `created_at`, at most `batch_size`.
    ///
    /// With `exclude_prior_failure`, a due record only qualifies its key when no
    /// earlier record of the same key is FAILED or still waiting for its retry.
    fn find_ready_keys(
        &self,
        partitions: &[PartitionNumber],
        status: RecordStatus,
        batch_size: usize,
        exclude_prior_failure: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// All NEW records of `key`, oldest first.
    fn find_incomplete_records_by_key(&self, key: &str) -> Result<Vec<OutboxRecord>, StoreError>;

    fn count_by_status(&self, status: RecordStatus) -> Result<usize, StoreError>;

    /// Records in `status`, oldest first, at most `limit`.
    fn find_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Delete every record in `status`. Returns the number removed.
    fn delete_by_status(&self, status: RecordStatus) -> Result<usize, StoreError>;
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<RecordId, OutboxRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn creation_order(a: &&OutboxRecord, b: &&OutboxRecord) -> std::cmp::Ordering {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(b.id()))
    }
}

impl RecordStore for InMemoryRecordStore {
    fn save(&self, record: &OutboxRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        records.insert(record.id().clone(), record.clone());
        Ok(())
    }

    fn find_by_id(&self, id: &RecordId) -> Result<Option<OutboxRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.get(id).cloned())
    }

    fn delete_by_id(&self, id: &RecordId) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        Ok(records.remove(id).is_some())
    }

    fn find_ready_keys(
        &self,
        partitions: &[PartitionNumber],
        status: RecordStatus,
        batch_size: usize,
        exclude_prior_failure: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let partitions: HashSet<PartitionNumber> = partitions.iter().copied().collect();

        let mut by_key: HashMap<&str, Vec<&OutboxRecord>> = HashMap::new();
        for record in records.values() {
            if partitions.contains(&record.partition()) {
                by_key.entry(record.key()).or_default().push(record);
            }
        }

        let is_ready = |r: &OutboxRecord| r.status() == status && r.next_retry_at() < now;

        let mut ready: Vec<(DateTime<Utc>, &str)> = Vec::new();
        for (key, mut key_records) in by_key {
            key_records.sort_by(Self::creation_order);

            let oldest_ready = if exclude_prior_failure {
                let mut found = None;
                for r in key_records {
                    if is_ready(r) {
                        found = Some(r.created_at());
                        break;
                    }
                    // FAILED, or NEW but not yet due: the key's head is blocked.
                    if r.status() != RecordStatus::Completed {
                        break;
                    }
                }
                found
            } else {
                key_records
                    .into_iter()
                    .find(|&r| is_ready(r))
                    .map(|r| r.created_at())
            };

            if let Some(created_at) = oldest_ready {
                ready.push((created_at, key));
            }
        }

        ready.sort();
        Ok(ready
            .into_iter()
            .take(batch_size)
            .map(|(_, key)| key.to_string())
            .collect())
    }

    fn find_incomplete_records_by_key(&self, key: &str) -> Result<Vec<OutboxRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<&OutboxRecord> = records
            .values()
            .filter(|r| r.key() == key && r.status() == RecordStatus::New)
            .collect();
        result.sort_by(Self::creation_order);
        Ok(result.into_iter().cloned().collect())
    }

    fn count_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.values().filter(|r| r.status() == status).count())
    }

    fn find_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<&OutboxRecord> =
            records.values().filter(|r| r.status() == status).collect();
        result.sort_by(Self::creation_order);
        result.truncate(limit);
        Ok(result.into_iter().cloned().collect())
    }

    fn delete_by_status(&self, status: RecordStatus) -> Result<usize, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        let before = records.len();
        records.retain(|_, r| r.status() != status);
        Ok(before - records.len())
    }
}
