//! Liveness tracking for this and peer instances.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use outpost_core::{Clock, InstanceId, InstanceStatus, OutboxInstance};

use crate::store::{InstanceStore, StoreError};

/// Who this process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub port: u16,
}

impl InstanceIdentity {
    pub fn new(instance_id: InstanceId, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id,
            hostname: hostname.into(),
            port,
        }
    }
}

/// Registers the local instance and judges peers by heartbeat age.
///
/// An instance counts as live while it is ACTIVE and its last heartbeat is
/// within `stale_timeout` of now.
pub struct InstanceRegistry {
    identity: InstanceIdentity,
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    stale_timeout: Duration,
}

impl InstanceRegistry {
    pub fn new(
        identity: InstanceIdentity,
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
        stale_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            store,
            clock,
            stale_timeout,
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.identity.instance_id
    }

    /// Upsert the local instance as ACTIVE with a fresh heartbeat.
    pub fn register_instance(&self) -> Result<OutboxInstance, StoreError> {
        let now = self.clock.now();
        let instance = match self.store.find_by_id(self.instance_id())? {
            Some(mut existing) => {
                existing.hostname = self.identity.hostname.clone();
                existing.port = self.identity.port;
                existing.set_status(InstanceStatus::Active, now);
                existing.renew_heartbeat(now);
                existing
            }
            None => OutboxInstance::active(
                self.identity.instance_id.clone(),
                self.identity.hostname.clone(),
                self.identity.port,
                now,
            ),
        };
        self.store.save(&instance)?;

        info!(
            instance_id = %instance.instance_id,
            hostname = %instance.hostname,
            port = instance.port,
            "outbox instance registered"
        );
        Ok(instance)
    }

    pub fn renew_heartbeat(&self, instance_id: &InstanceId, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.store.update_heartbeat(instance_id, now)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("instance {instance_id}")))
        }
    }

    /// Refresh the local heartbeat, re-registering if the row is gone or a
    /// peer declared this instance dead.
    pub fn heartbeat(&self) -> Result<(), StoreError> {
        let current = self.store.find_by_id(self.instance_id())?;
        match current {
            Some(instance) if instance.status != InstanceStatus::Dead => {
                self.renew_heartbeat(self.instance_id(), self.clock.now())?;
                debug!(instance_id = %self.instance_id(), "heartbeat renewed");
                Ok(())
            }
            Some(_) | None => {
                warn!(
                    instance_id = %self.instance_id(),
                    "instance row missing or marked dead; re-registering"
                );
                self.register_instance().map(|_| ())
            }
        }
    }

    pub fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.store.update_status(instance_id, status, now)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("instance {instance_id}")))
        }
    }

    pub fn find_active_instances(&self) -> Result<Vec<OutboxInstance>, StoreError> {
        self.store.find_by_status(InstanceStatus::Active)
    }

    /// Non-terminal instances whose heartbeat is older than `cutoff`.
    pub fn find_instances_with_stale_heartbeat(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OutboxInstance>, StoreError> {
        self.store.find_stale(cutoff)
    }

    /// Ids of ACTIVE instances whose heartbeat is not stale.
    pub fn live_instance_ids(&self) -> Result<BTreeSet<InstanceId>, StoreError> {
        let cutoff = self.stale_cutoff();
        Ok(self
            .find_active_instances()?
            .into_iter()
            .filter(|i| i.last_heartbeat >= cutoff)
            .map(|i| i.instance_id)
            .collect())
    }

    /// Mark peers with stale heartbeats DEAD. Never marks the local instance.
    pub fn mark_stale_instances_dead(&self) -> Result<Vec<InstanceId>, StoreError> {
        let now = self.clock.now();
        let mut marked = Vec::new();
        for instance in self.find_instances_with_stale_heartbeat(self.stale_cutoff())? {
            if &instance.instance_id == self.instance_id() {
                continue;
            }
            if self
                .store
                .update_status(&instance.instance_id, InstanceStatus::Dead, now)?
            {
                warn!(
                    instance_id = %instance.instance_id,
                    last_heartbeat = %instance.last_heartbeat,
                    "instance heartbeat stale; marked dead"
                );
                marked.push(instance.instance_id);
            }
        }
        Ok(marked)
    }

    /// Delete DEAD rows not updated within `older_than`.
    pub fn remove_dead_instances(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = self.cutoff(older_than);
        let mut removed = 0;
        for instance in self.store.find_by_status(InstanceStatus::Dead)? {
            if instance.updated_at < cutoff && self.store.delete_by_id(&instance.instance_id)? {
                debug!(instance_id = %instance.instance_id, "dead instance removed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Announce shutdown, then remove the local instance row.
    pub fn deregister(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store
            .update_status(self.instance_id(), InstanceStatus::ShuttingDown, now)?;
        self.store.delete_by_id(self.instance_id())?;
        info!(instance_id = %self.instance_id(), "outbox instance deregistered");
        Ok(())
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        self.cutoff(self.stale_timeout)
    }

    fn cutoff(&self, age: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
