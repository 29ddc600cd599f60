//! Outbox record: one unit of work awaiting delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{OutboxError, OutboxResult};
use crate::id::RecordId;
use crate::partition::{PartitionHasher, PartitionNumber};

/// Record delivery status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Awaiting (re)delivery
    New,
    /// Delivered by the handler or its fallback
    Completed,
    /// Permanently failed
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

/// A durable unit of work handed to a handler.
///
/// Records are only mutated by the record processor; everything else sees
/// them read-only. `partition` is always derived from `key`; serde goes
/// through [`RecordSnapshot`] so a decoded record recomputes it too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RecordSnapshot", into = "RecordSnapshot")]
pub struct OutboxRecord {
    id: RecordId,
    key: String,
    partition: PartitionNumber,
    payload: JsonValue,
    context: BTreeMap<String, String>,
    handler_id: String,
    status: RecordStatus,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure_count: u32,
    failure_reason: Option<String>,
    next_retry_at: DateTime<Utc>,
}

/// Persisted form of a record, used to rebuild it from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub id: RecordId,
    pub key: String,
    pub payload: JsonValue,
    pub context: BTreeMap<String, String>,
    pub handler_id: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub failure_reason: Option<String>,
    pub next_retry_at: DateTime<Utc>,
}

impl From<RecordSnapshot> for OutboxRecord {
    fn from(snapshot: RecordSnapshot) -> Self {
        Self::restore(snapshot)
    }
}

impl From<OutboxRecord> for RecordSnapshot {
    fn from(record: OutboxRecord) -> Self {
        record.snapshot()
    }
}

impl OutboxRecord {
    pub fn builder() -> OutboxRecordBuilder {
        OutboxRecordBuilder::default()
    }

    /// Rebuild a record from its persisted state. Pure: no validation, no clock.
    pub fn restore(snapshot: RecordSnapshot) -> Self {
        Self {
            partition: PartitionHasher::partition_for(&snapshot.key),
            id: snapshot.id,
            key: snapshot.key,
            payload: snapshot.payload,
            context: snapshot.context,
            handler_id: snapshot.handler_id,
            status: snapshot.status,
            created_at: snapshot.created_at,
            completed_at: snapshot.completed_at,
            failure_count: snapshot.failure_count,
            failure_reason: snapshot.failure_reason,
            next_retry_at: snapshot.next_retry_at,
        }
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id.clone(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            context: self.context.clone(),
            handler_id: self.handler_id.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            next_retry_at: self.next_retry_at,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn partition(&self) -> PartitionNumber {
        self.partition
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }

    /// Mark as completed. The first completion timestamp wins.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        if self.status == RecordStatus::Completed {
            return;
        }
        self.status = RecordStatus::Completed;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self) {
        self.status = RecordStatus::Failed;
    }

    pub fn increment_failure_count(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    pub fn record_failure_reason(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
    }

    /// True iff the record is NEW and its retry time is strictly in the past.
    pub fn can_be_retried(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::New && self.next_retry_at < now
    }

    /// True iff more failures than `max_retries` have been recorded.
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.failure_count > max_retries
    }

    pub fn schedule_next_retry(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

/// Builder for new records.
///
/// `payload` and `handler_id` are required; `id` and `key` are generated when
/// omitted.
#[derive(Debug, Default, Clone)]
pub struct OutboxRecordBuilder {
    id: Option<RecordId>,
    key: Option<String>,
    payload: Option<JsonValue>,
    context: BTreeMap<String, String>,
    handler_id: Option<String>,
}

impl OutboxRecordBuilder {
    pub fn id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn handler_id(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }

    /// Replace the whole context map.
    pub fn context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn context_entry(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    pub fn build(self, clock: &dyn Clock) -> OutboxResult<OutboxRecord> {
        let payload = self
            .payload
            .ok_or_else(|| OutboxError::validation("record payload is required"))?;
        let handler_id = self
            .handler_id
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| OutboxError::validation("record handler id is required"))?;

        let key = self.key.unwrap_or_else(|| Uuid::now_v7().to_string());
        let now = clock.now();

        Ok(OutboxRecord {
            id: self.id.unwrap_or_default(),
            partition: PartitionHasher::partition_for(&key),
            key,
            payload,
            context: self.context,
            handler_id,
            status: RecordStatus::New,
            created_at: now,
            completed_at: None,
            failure_count: 0,
            failure_reason: None,
            next_retry_at: now,
        })
    }
}
