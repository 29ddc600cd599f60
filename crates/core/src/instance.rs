//! Running outbox instances and their liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::InstanceId;

/// Lifecycle status of an instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    ShuttingDown,
    /// Declared dead by a peer after its heartbeat went stale
    Dead,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Dead)
    }
}

/// A process participating in partition ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxInstance {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxInstance {
    /// A freshly started, active instance.
    pub fn active(
        instance_id: InstanceId,
        hostname: impl Into<String>,
        port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            hostname: hostname.into(),
            port,
            status: InstanceStatus::Active,
            started_at: now,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Non-terminal and not heard from since `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.last_heartbeat < cutoff
    }

    pub fn renew_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: InstanceStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}
