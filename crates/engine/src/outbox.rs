//! Application-facing entry point for scheduling records.
//!
//! Callers persist records here inside (or alongside) their own business
//! write; the runtime delivers them later.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use outpost_core::{Clock, OutboxError, OutboxRecord, RecordStatus};

use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Record(#[from] OutboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub new: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl Outbox {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Schedule `payload` for `handler_id` under a generated key.
    pub fn schedule(&self, payload: JsonValue, handler_id: &str) -> Result<OutboxRecord, ScheduleError> {
        let record = OutboxRecord::builder()
            .payload(payload)
            .handler_id(handler_id)
            .build(self.clock.as_ref())?;
        self.persist(record)
    }

    /// Schedule under `key`; records sharing a key are delivered in order.
    pub fn schedule_with_key(
        &self,
        key: &str,
        payload: JsonValue,
        handler_id: &str,
    ) -> Result<OutboxRecord, ScheduleError> {
        let record = OutboxRecord::builder()
            .key(key)
            .payload(payload)
            .handler_id(handler_id)
            .build(self.clock.as_ref())?;
        self.persist(record)
    }

    /// Schedule a record built by the caller. Only NEW records are accepted.
    pub fn schedule_record(&self, record: OutboxRecord) -> Result<OutboxRecord, ScheduleError> {
        if record.status() != RecordStatus::New {
            return Err(OutboxError::invalid_state(format!(
                "record {} is {:?}, only NEW records can be scheduled",
                record.id(),
                record.status()
            ))
            .into());
        }
        self.persist(record)
    }

    pub fn stats(&self) -> Result<OutboxStats, StoreError> {
        Ok(OutboxStats {
            new: self.store.count_by_status(RecordStatus::New)?,
            completed: self.store.count_by_status(RecordStatus::Completed)?,
            failed: self.store.count_by_status(RecordStatus::Failed)?,
        })
    }

    /// Terminally failed records, oldest first.
    pub fn failed_records(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.store.find_by_status(RecordStatus::Failed, limit)
    }

    /// Delete every COMPLETED record. Returns how many were removed.
    pub fn purge_completed(&self) -> Result<usize, StoreError> {
        let removed = self.store.delete_by_status(RecordStatus::Completed)?;
        if removed > 0 {
            debug!(removed, "purged completed records");
        }
        Ok(removed)
    }

    fn persist(&self, record: OutboxRecord) -> Result<OutboxRecord, ScheduleError> {
        self.store.save(&record)?;
        debug!(
            record_id = %record.id(),
            key = %record.key(),
            partition = record.partition(),
            handler_id = %record.handler_id(),
            "record scheduled"
        );
        Ok(record)
    }
}
