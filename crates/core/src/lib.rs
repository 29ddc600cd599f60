//! `outpost-core` — data model of the transactional outbox.
//!
//! This crate contains **pure** building blocks (no storage, no threads):
//! records, instances, partition assignments, the partition hasher and the
//! injectable clock.

pub mod assignment;
pub mod clock;
pub mod error;
pub mod id;
pub mod instance;
pub mod partition;
pub mod record;

pub use assignment::PartitionAssignment;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OutboxError, OutboxResult};
pub use id::{InstanceId, RecordId};
pub use instance::{InstanceStatus, OutboxInstance};
pub use partition::{PartitionHasher, PartitionNumber, TOTAL_PARTITIONS};
pub use record::{OutboxRecord, OutboxRecordBuilder, RecordSnapshot, RecordStatus};
