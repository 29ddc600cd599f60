//! Partition ownership storage.
//!
//! Ownership changes are compare-and-set operations: each claim states which
//! owners it expects to replace and fails with [`StoreError::Conflict`] if the
//! row changed underneath it. This is the only cross-instance mutual
//! exclusion in the system.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use outpost_core::{InstanceId, PartitionAssignment, PartitionHasher, PartitionNumber};

use super::StoreError;

/// Partition store abstraction.
pub trait PartitionStore: Send + Sync {
    /// All partition rows, ordered by partition number.
    fn find_all(&self) -> Result<Vec<PartitionAssignment>, StoreError>;

    fn find_by_instance_id(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<PartitionAssignment>, StoreError>;

    /// Bootstrap: atomically create every partition owned by `instance_id`.
    ///
    /// Returns `true` when the caller owns the whole space afterwards (including
    /// a repeated call by the same winner) and `false` when another instance
    /// already holds rows.
    fn claim_all_partitions(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release `numbers`, all of which must be owned by `owner`.
    fn release_partitions(
        &self,
        numbers: &[PartitionNumber],
        owner: &InstanceId,
    ) -> Result<(), StoreError>;

    /// Claim `numbers` for `new_owner`.
    ///
    /// Every target's current owner must be one of `expected_owners`, or unowned
    /// when `expected_owners` is `None`. All-or-nothing.
    fn claim_stale_partitions(
        &self,
        numbers: &[PartitionNumber],
        expected_owners: Option<&BTreeSet<InstanceId>>,
        new_owner: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// In-memory partition table for tests/dev.
///
/// A single mutex makes every operation a serialisable transaction, which is
/// the atomicity a durable adapter gets from conditional updates.
#[derive(Debug, Default)]
pub struct InMemoryPartitionStore {
    partitions: Mutex<BTreeMap<PartitionNumber, PartitionAssignment>>,
}

impl InMemoryPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl PartitionStore for InMemoryPartitionStore {
    fn find_all(&self) -> Result<Vec<PartitionAssignment>, StoreError> {
        let partitions = self.partitions.lock().map_err(|_| StoreError::poisoned())?;
        Ok(partitions.values().cloned().collect())
    }

    fn find_by_instance_id(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<PartitionAssignment>, StoreError> {
        let partitions = self.partitions.lock().map_err(|_| StoreError::poisoned())?;
        Ok(partitions
            .values()
            .filter(|p| p.is_owned_by(instance_id))
            .cloned()
            .collect())
    }

    fn claim_all_partitions(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::poisoned())?;

        if !partitions.is_empty() {
            return Ok(partitions.values().all(|p| p.is_owned_by(instance_id)));
        }

        for number in PartitionHasher::all_partitions() {
            partitions.insert(
                number,
                PartitionAssignment::owned(number, instance_id.clone(), now),
            );
        }
        Ok(true)
    }

    fn release_partitions(
        &self,
        numbers: &[PartitionNumber],
        owner: &InstanceId,
    ) -> Result<(), StoreError> {
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::poisoned())?;

        for number in numbers {
            let row = partitions
                .get(number)
                .ok_or_else(|| StoreError::NotFound(format!("partition {number}")))?;
            if !row.is_owned_by(owner) {
                return Err(StoreError::InvalidState(format!(
                    "partition {number} is not owned by {owner}"
                )));
            }
        }

        for number in numbers {
            if let Some(row) = partitions.get_mut(number) {
                row.instance_id = None;
            }
        }
        Ok(())
    }

    fn claim_stale_partitions(
        &self,
        numbers: &[PartitionNumber],
        expected_owners: Option<&BTreeSet<InstanceId>>,
        new_owner: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::poisoned())?;

        for number in numbers {
            let row = partitions
                .get(number)
                .ok_or_else(|| StoreError::NotFound(format!("partition {number}")))?;

            let matches = match (expected_owners, row.instance_id.as_ref()) {
                (None, None) => true,
                (Some(expected), Some(current)) => expected.contains(current),
                _ => false,
            };
            if !matches {
                return Err(StoreError::Conflict(format!(
                    "partition {number} owner changed (found {:?})",
                    row.instance_id.as_ref().map(InstanceId::as_str)
                )));
            }
        }

        for number in numbers {
            if let Some(row) = partitions.get_mut(number) {
                row.instance_id = Some(new_owner.clone());
                row.claimed_at = now;
            }
        }
        Ok(())
    }
}
