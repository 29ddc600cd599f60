//! Instance row storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use outpost_core::{InstanceId, InstanceStatus, OutboxInstance};

use super::StoreError;

/// Instance store abstraction.
pub trait InstanceStore: Send + Sync {
    /// Insert or replace an instance row.
    fn save(&self, instance: &OutboxInstance) -> Result<(), StoreError>;

    fn find_by_id(&self, instance_id: &InstanceId) -> Result<Option<OutboxInstance>, StoreError>;

    fn find_all(&self) -> Result<Vec<OutboxInstance>, StoreError>;

    fn find_by_status(&self, status: InstanceStatus) -> Result<Vec<OutboxInstance>, StoreError>;

    /// Returns `false` when the instance row does not exist.
    fn update_heartbeat(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns `false` when the instance row does not exist.
    fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// ACTIVE / SHUTTING_DOWN instances whose last heartbeat is before `cutoff`.
    fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxInstance>, StoreError>;

    fn delete_by_id(&self, instance_id: &InstanceId) -> Result<bool, StoreError>;
}

/// In-memory instance store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, OutboxInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted(mut instances: Vec<OutboxInstance>) -> Vec<OutboxInstance> {
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn save(&self, instance: &OutboxInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().map_err(|_| StoreError::poisoned())?;
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    fn find_by_id(&self, instance_id: &InstanceId) -> Result<Option<OutboxInstance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::poisoned())?;
        Ok(instances.get(instance_id).cloned())
    }

    fn find_all(&self) -> Result<Vec<OutboxInstance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::poisoned())?;
        Ok(Self::sorted(instances.values().cloned().collect()))
    }

    fn find_by_status(&self, status: InstanceStatus) -> Result<Vec<OutboxInstance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::poisoned())?;
        Ok(Self::sorted(
            instances
                .values()
                .filter(|i| i.status == status)
                .cloned()
                .collect(),
        ))
    }

    fn update_heartbeat(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut instances = self.instances.write().map_err(|_| StoreError::poisoned())?;
        match instances.get_mut(instance_id) {
            Some(instance) => {
                instance.renew_heartbeat(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut instances = self.instances.write().map_err(|_| StoreError::poisoned())?;
        match instances.get_mut(instance_id) {
            Some(instance) => {
                instance.set_status(status, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxInstance>, StoreError> {
        let instances = self.instances.read().map_err(|_| StoreError::poisoned())?;
        Ok(Self::sorted(
            instances
                .values()
                .filter(|i| i.is_stale(cutoff))
                .cloned()
                .collect(),
        ))
    }

    fn delete_by_id(&self, instance_id: &InstanceId) -> Result<bool, StoreError> {
        let mut instances = self.instances.write().map_err(|_| StoreError::poisoned())?;
        Ok(instances.remove(instance_id).is_some())
    }
}
