//! `outpost-engine` — distributed processing of outbox records.
//!
//! Records are spread over a fixed partition space; each running instance owns
//! a share of the partitions and delivers the records in them with
//! at-least-once semantics, in creation order per key.
//!
//! ## Components
//!
//! - [`store`]: storage seams (records, partitions, instances) + in-memory adapters
//! - [`instance_registry`]: heartbeats and liveness
//! - [`coordinator`]: bootstrap and fair-share rebalance of partitions
//! - [`limiter`]: admission control for concurrently processed keys
//! - [`retry`]: retry policies and per-handler resolution
//! - [`handler`]: handler/fallback dispatch and the startup registry
//! - [`processor`]: delivers one record and resolves its outcome
//! - [`scheduler`]: poll cycles, worker dispatch, graceful drain
//! - [`runtime`]: background poll/heartbeat/rebalance loops
//! - [`outbox`]: scheduling facade for applications
//! - [`config`]: configuration from code or environment

pub mod config;
pub mod coordinator;
pub mod handler;
pub mod instance_registry;
pub mod limiter;
pub mod outbox;
pub mod pool;
pub mod processor;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use config::{ConfigError, OutboxConfig, RetryConfig, RetryPolicyKind};
pub use coordinator::{PartitionCoordinator, RebalanceReport};
pub use handler::{
    FailureContext, FallbackInvoker, HandlerError, HandlerInvoker, HandlerMetadata,
    HandlerRegistry,
};
pub use instance_registry::{InstanceIdentity, InstanceRegistry};
pub use limiter::{LimiterError, ProcessingLimiter};
pub use outbox::{Outbox, OutboxStats, ScheduleError};
pub use processor::{RecordOutcome, RecordProcessor};
pub use retry::{RetryFilter, RetryPolicy, RetryPolicyRegistry};
pub use runtime::{OutboxComponents, OutboxRuntime, RuntimeError, RuntimeHandle};
pub use scheduler::{
    ProcessingScheduler, SchedulerConfig, SchedulerError, SchedulerState, SchedulerStats,
    ShutdownReport,
};
pub use store::StoreError;
