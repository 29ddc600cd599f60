//! Background loops that drive the engine.
//!
//! [`OutboxRuntime::start`] registers the instance, claims partitions, and
//! spawns three named threads:
//!
//! - `outpost-poll`: one scheduler cycle per `poll_interval`
//! - `outpost-heartbeat`: renew our heartbeat, mark stale peers DEAD
//! - `outpost-rebalance`: converge partition ownership
//!
//! Loop failures are logged and retried on the next tick. Shutdown goes
//! through [`RuntimeHandle::shutdown`].

use std::io;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use outpost_core::{Clock, InstanceId, PartitionNumber, SystemClock};

use crate::config::{ConfigError, OutboxConfig};
use crate::coordinator::PartitionCoordinator;
use crate::handler::{FallbackInvoker, HandlerInvoker, HandlerRegistry};
use crate::instance_registry::InstanceRegistry;
use crate::limiter::ProcessingLimiter;
use crate::outbox::Outbox;
use crate::processor::RecordProcessor;
use crate::retry::RetryPolicyRegistry;
use crate::scheduler::{ProcessingScheduler, SchedulerError, SchedulerStats, ShutdownReport};
use crate::store::{
    InMemoryInstanceStore, InMemoryPartitionStore, InMemoryRecordStore, InstanceStore,
    PartitionStore, RecordStore, StoreError,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("instance registration failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Collaborators the runtime is wired from.
#[derive(Clone)]
pub struct OutboxComponents {
    pub records: Arc<dyn RecordStore>,
    pub partitions: Arc<dyn PartitionStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub handlers: Arc<dyn HandlerInvoker>,
    pub fallbacks: Arc<dyn FallbackInvoker>,
    /// `None` builds a registry from the configured default retry policy.
    pub policies: Option<Arc<RetryPolicyRegistry>>,
    pub clock: Arc<dyn Clock>,
}

impl OutboxComponents {
    /// In-memory stores, wall clock, a single registry for handlers and fallbacks.
    pub fn in_memory(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            records: InMemoryRecordStore::arc(),
            partitions: InMemoryPartitionStore::arc(),
            instances: InMemoryInstanceStore::arc(),
            handlers: handlers.clone(),
            fallbacks: handlers,
            policies: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policies(mut self, policies: Arc<RetryPolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct OutboxRuntime;

impl OutboxRuntime {
    pub fn start(components: OutboxComponents, config: OutboxConfig) -> Result<RuntimeHandle, RuntimeError> {
        config.validate()?;
        let OutboxComponents {
            records,
            partitions,
            instances,
            handlers,
            fallbacks,
            policies,
            clock,
        } = components;

        let registry = Arc::new(InstanceRegistry::new(
            config.identity(),
            instances,
            clock.clone(),
            config.stale_instance_timeout,
        ));
        registry.register_instance()?;

        let coordinator = Arc::new(PartitionCoordinator::new(
            registry.clone(),
            partitions,
            clock.clone(),
        ));
        if let Err(err) = coordinator.rebalance() {
            warn!(error = %err, "initial rebalance failed; retrying on schedule");
        }

        let policies =
            policies.unwrap_or_else(|| Arc::new(RetryPolicyRegistry::new(config.retry.build())));
        let processor = Arc::new(
            RecordProcessor::new(records.clone(), handlers, fallbacks, policies, clock.clone())
                .with_delete_completed(config.delete_completed),
        );
        let scheduler = Arc::new(ProcessingScheduler::new(
            coordinator.clone(),
            records.clone(),
            processor,
            Arc::new(ProcessingLimiter::new(config.max_concurrent_keys)),
            clock.clone(),
            config.scheduler(),
        )?);

        let poll = {
            let scheduler = scheduler.clone();
            spawn_loop("outpost-poll", config.poll_interval, move || {
                if let Err(err) = scheduler.process() {
                    warn!(error = %err, "poll cycle aborted");
                }
            })?
        };

        let heartbeat = {
            let registry = registry.clone();
            let dead_retention = config.stale_instance_timeout.saturating_mul(2);
            spawn_loop("outpost-heartbeat", config.heartbeat_interval, move || {
                if let Err(err) = registry.heartbeat() {
                    warn!(error = %err, "heartbeat failed");
                }
                if let Err(err) = registry.mark_stale_instances_dead() {
                    warn!(error = %err, "stale instance sweep failed");
                }
                if let Err(err) = registry.remove_dead_instances(dead_retention) {
                    warn!(error = %err, "dead instance cleanup failed");
                }
            })?
        };

        let rebalance = {
            let coordinator = coordinator.clone();
            spawn_loop("outpost-rebalance", config.rebalance_interval, move || {
                match coordinator.rebalance() {
                    Ok(report) => debug!(
                        owned = report.owned,
                        target = report.target,
                        claimed = report.claimed,
                        released = report.released,
                        "rebalance complete"
                    ),
                    Err(err) => warn!(error = %err, "rebalance failed; retrying next tick"),
                }
            })?
        };

        info!(
            instance_id = %registry.instance_id(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            max_concurrent_keys = config.max_concurrent_keys,
            "outbox runtime started"
        );

        Ok(RuntimeHandle {
            outbox: Outbox::new(records, clock),
            registry,
            coordinator,
            scheduler,
            poll,
            heartbeat,
            rebalance,
        })
    }
}

/// Handle to a running engine.
pub struct RuntimeHandle {
    outbox: Outbox,
    registry: Arc<InstanceRegistry>,
    coordinator: Arc<PartitionCoordinator>,
    scheduler: Arc<ProcessingScheduler>,
    poll: LoopHandle,
    heartbeat: LoopHandle,
    rebalance: LoopHandle,
}

impl RuntimeHandle {
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.registry.instance_id()
    }

    pub fn assigned_partitions(&self) -> Result<Vec<PartitionNumber>, StoreError> {
        self.coordinator.get_assigned_partition_numbers()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop polling, drain in-flight keys, hand partitions back and leave the
    /// instance table.
    pub fn shutdown(self) -> ShutdownReport {
        let instance_id = self.instance_id().clone();
        info!(instance_id = %instance_id, "outbox runtime shutting down");
        self.poll.stop();
        let report = self.scheduler.initiate_shutdown();
        self.rebalance.stop();
        self.heartbeat.stop();

        if let Err(err) = self.coordinator.release_all() {
            error!(error = %err, "failed to release partitions on shutdown");
        }
        if let Err(err) = self.registry.deregister() {
            error!(error = %err, "failed to deregister instance");
        }
        info!(
            instance_id = %instance_id,
            drained = report.drained,
            "outbox runtime stopped"
        );
        report
    }
}

struct LoopHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

impl LoopHandle {
    fn stop(self) {
        let _ = self.shutdown.send(());
        if self.join.join().is_err() {
            error!(thread = self.name, "loop thread panicked");
        }
    }
}

/// Run `tick` every `interval` until the handle is stopped.
fn spawn_loop<F>(name: &'static str, interval: Duration, mut tick: F) -> Result<LoopHandle, RuntimeError>
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(thread = name, "loop started");
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(thread = name, "loop stopped");
        })
        .map_err(|source| RuntimeError::Spawn { name, source })?;

    Ok(LoopHandle {
        name,
        shutdown: shutdown_tx,
        join,
    })
}
