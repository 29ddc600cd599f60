//! Partition ownership across instances.
//!
//! ## Rebalance
//!
//! 1. Read the live instance set (ACTIVE, fresh heartbeat).
//! 2. Empty partition table: bootstrap by claiming the whole space in one
//!    atomic operation. Two racing instances end with one owning everything.
//! 3. Otherwise converge toward an even split: release this instance's surplus,
//!    then claim unassigned partitions and partitions owned by instances that
//!    are no longer live, each claim conditional on the owners we observed.
//!
//! The coordinator keeps no state between calls; every call re-reads storage,
//! so a failed rebalance is simply retried on the next tick.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use outpost_core::{Clock, InstanceId, PartitionAssignment, PartitionNumber, TOTAL_PARTITIONS};

use crate::instance_registry::InstanceRegistry;
use crate::store::{PartitionStore, StoreError};

/// What one rebalance pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    /// The table was empty and this pass attempted the bootstrap.
    pub bootstrap: bool,
    /// Fair share for this instance (0 when it is not live).
    pub target: usize,
    pub released: usize,
    pub claimed: usize,
    /// Partitions owned after the pass.
    pub owned: usize,
}

/// Fair share for the instance at `position` among `live` sorted instances.
///
/// `floor(total / live)` each, the first `total % live` instances get one more.
pub fn fair_share(total: usize, live: usize, position: usize) -> usize {
    if live == 0 || position >= live {
        return 0;
    }
    let base = total / live;
    let remainder = total % live;
    base + usize::from(position < remainder)
}

pub struct PartitionCoordinator {
    registry: Arc<InstanceRegistry>,
    partitions: Arc<dyn PartitionStore>,
    clock: Arc<dyn Clock>,
}

impl PartitionCoordinator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        partitions: Arc<dyn PartitionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            partitions,
            clock,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.registry.instance_id()
    }

    /// Partition numbers currently owned by this instance, ascending.
    pub fn get_assigned_partition_numbers(&self) -> Result<Vec<PartitionNumber>, StoreError> {
        let mut numbers: Vec<PartitionNumber> = self
            .partitions
            .find_by_instance_id(self.instance_id())?
            .into_iter()
            .map(|p| p.partition_number)
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn rebalance(&self) -> Result<RebalanceReport, StoreError> {
        let me = self.instance_id().clone();
        let live = self.registry.live_instance_ids()?;
        let assignments = self.partitions.find_all()?;

        if assignments.is_empty() {
            return self.bootstrap(&me);
        }

        let position = live.iter().position(|id| *id == me);
        let target = position
            .map(|p| fair_share(TOTAL_PARTITIONS as usize, live.len(), p))
            .unwrap_or(0);
        if position.is_none() {
            warn!(instance_id = %me, "instance is not live; giving up all partitions");
        }

        let owned: Vec<PartitionNumber> = assignments
            .iter()
            .filter(|p| p.is_owned_by(&me))
            .map(|p| p.partition_number)
            .collect();

        let mut report = RebalanceReport {
            target,
            owned: owned.len(),
            ..Default::default()
        };

        if owned.len() > target {
            let mut surplus = owned;
            surplus.sort_unstable();
            let surplus: Vec<PartitionNumber> = surplus.split_off(target);
            self.partitions.release_partitions(&surplus, &me)?;
            report.released = surplus.len();
            report.owned -= surplus.len();
            info!(
                instance_id = %me,
                released = surplus.len(),
                target,
                "released surplus partitions"
            );
            return Ok(report);
        }

        let mut need = target - owned.len();
        if need == 0 {
            debug!(instance_id = %me, owned = report.owned, "partition ownership balanced");
            return Ok(report);
        }

        let unassigned: Vec<PartitionNumber> = assignments
            .iter()
            .filter(|p| p.is_unassigned())
            .map(|p| p.partition_number)
            .take(need)
            .collect();
        if !unassigned.is_empty() {
            self.partitions
                .claim_stale_partitions(&unassigned, None, &me, self.clock.now())?;
            need -= unassigned.len();
            report.claimed += unassigned.len();
        }

        if need > 0 {
            let orphaned: Vec<&PartitionAssignment> = assignments
                .iter()
                .filter(|p| {
                    p.instance_id
                        .as_ref()
                        .is_some_and(|owner| *owner != me && !live.contains(owner))
                })
                .take(need)
                .collect();
            if !orphaned.is_empty() {
                let numbers: Vec<PartitionNumber> =
                    orphaned.iter().map(|p| p.partition_number).collect();
                let previous_owners: BTreeSet<InstanceId> = orphaned
                    .iter()
                    .filter_map(|p| p.instance_id.clone())
                    .collect();
                self.partitions.claim_stale_partitions(
                    &numbers,
                    Some(&previous_owners),
                    &me,
                    self.clock.now(),
                )?;
                report.claimed += numbers.len();
                info!(
                    instance_id = %me,
                    claimed = numbers.len(),
                    previous_owners = ?previous_owners,
                    "reclaimed partitions from departed instances"
                );
            }
        }

        report.owned += report.claimed;
        if report.claimed > 0 {
            info!(
                instance_id = %me,
                claimed = report.claimed,
                owned = report.owned,
                target,
                "claimed partitions"
            );
        }
        Ok(report)
    }

    /// Release every partition this instance owns (graceful shutdown).
    pub fn release_all(&self) -> Result<usize, StoreError> {
        let owned = self.get_assigned_partition_numbers()?;
        if !owned.is_empty() {
            self.partitions.release_partitions(&owned, self.instance_id())?;
            info!(instance_id = %self.instance_id(), released = owned.len(), "released all partitions");
        }
        Ok(owned.len())
    }

    fn bootstrap(&self, me: &InstanceId) -> Result<RebalanceReport, StoreError> {
        let won = self.partitions.claim_all_partitions(me, self.clock.now())?;
        let owned = if won { TOTAL_PARTITIONS as usize } else { 0 };
        if won {
            info!(instance_id = %me, partitions = owned, "bootstrapped partition table");
        } else {
            debug!(instance_id = %me, "partition bootstrap lost to another instance");
        }
        Ok(RebalanceReport {
            bootstrap: true,
            target: owned,
            released: 0,
            claimed: owned,
            owned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fair_share_hands_remainder_to_first_instances() {
        assert_eq!(fair_share(256, 2, 0), 128);
        assert_eq!(fair_share(256, 2, 1), 128);
        assert_eq!(fair_share(256, 3, 0), 86);
        assert_eq!(fair_share(256, 3, 1), 85);
        assert_eq!(fair_share(256, 3, 2), 85);
        assert_eq!(fair_share(256, 0, 0), 0);
        assert_eq!(fair_share(256, 2, 2), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: fair shares always add up to the whole space and differ by at most one.
        #[test]
        fn fair_shares_cover_the_space(total in 1usize..2048, live in 1usize..64) {
            let shares: Vec<usize> = (0..live).map(|p| fair_share(total, live, p)).collect();
            prop_assert_eq!(shares.iter().sum::<usize>(), total);
            let min = *shares.iter().min().unwrap();
            let max = *shares.iter().max().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
