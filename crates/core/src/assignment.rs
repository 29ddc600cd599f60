//! Partition ownership rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::InstanceId;
use crate::partition::PartitionNumber;

/// Ownership of one partition by at most one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partition_number: PartitionNumber,
    /// `None` when the partition is currently unowned.
    pub instance_id: Option<InstanceId>,
    pub claimed_at: DateTime<Utc>,
}

impl PartitionAssignment {
    pub fn owned(partition_number: PartitionNumber, owner: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            partition_number,
            instance_id: Some(owner),
            claimed_at: now,
        }
    }

    pub fn is_owned_by(&self, instance_id: &InstanceId) -> bool {
        self.instance_id.as_ref() == Some(instance_id)
    }

    pub fn is_unassigned(&self) -> bool {
        self.instance_id.is_none()
    }
}
