//! Storage collaborators of the engine.
//!
//! The engine never talks to a concrete database. It depends on three narrow
//! interfaces:
//!
//! - [`RecordStore`]: outbox records (save / delete / ready-key queries)
//! - [`PartitionStore`]: partition ownership with atomic claim/release
//! - [`InstanceStore`]: instance rows, heartbeats, status
//!
//! Each interface ships an in-memory adapter for tests/dev. Durable adapters
//! must provide the same atomicity: every claim/release is all-or-nothing and
//! conditional on the current owner (compare-and-set), never guarded by an
//! in-process lock alone.

pub mod instance_store;
pub mod partition_store;
pub mod record_store;

pub use instance_store::{InMemoryInstanceStore, InstanceStore};
pub use partition_store::{InMemoryPartitionStore, PartitionStore};
pub use record_store::{InMemoryRecordStore, RecordStore};

use thiserror::Error;

/// Store operation error.
///
/// These are **infrastructure errors** as opposed to handler failures, which
/// never surface as a `StoreError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic ownership check failed; another instance got there first.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller asked for something its state does not allow (e.g. releasing
    /// a partition it does not own).
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }
}
