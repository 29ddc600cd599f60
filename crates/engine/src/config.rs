//! Engine configuration, from code or `OUTPOST_*` environment variables.
//!
//! Durations are given in milliseconds in the environment.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use outpost_core::InstanceId;

use crate::instance_registry::InstanceIdentity;
use crate::retry::{
    ExponentialBackoffRetryPolicy, FixedDelayRetryPolicy, JitteredRetryPolicy,
    LinearBackoffRetryPolicy, RetryPolicy,
};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicyKind {
    Fixed,
    Exponential,
    Linear,
}

impl FromStr for RetryPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown retry policy '{other}'")),
        }
    }
}

/// Default retry policy settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub kind: RetryPolicyKind,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Exponential growth factor; linear policies grow by `initial_delay`.
    pub multiplier: f64,
    /// Zero disables jitter.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            kind: RetryPolicyKind::Exponential,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        let base: Arc<dyn RetryPolicy> = match self.kind {
            RetryPolicyKind::Fixed => {
                Arc::new(FixedDelayRetryPolicy::new(self.initial_delay, self.max_retries))
            }
            RetryPolicyKind::Exponential => Arc::new(ExponentialBackoffRetryPolicy::new(
                self.initial_delay,
                self.multiplier,
                self.max_delay,
                self.max_retries,
            )),
            RetryPolicyKind::Linear => Arc::new(LinearBackoffRetryPolicy::new(
                self.initial_delay,
                self.initial_delay,
                self.max_delay,
                self.max_retries,
            )),
        };
        if self.jitter.is_zero() {
            base
        } else {
            Arc::new(JitteredRetryPolicy::new(base, self.jitter))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Generated when not configured.
    pub instance_id: InstanceId,
    pub hostname: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent_keys: usize,
    pub stop_on_first_failure: bool,
    pub delete_completed: bool,
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stale_instance_timeout: Duration,
    pub rebalance_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::new(),
            hostname: "localhost".to_string(),
            port: 8080,
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            max_concurrent_keys: 4,
            stop_on_first_failure: true,
            delete_completed: false,
            shutdown_timeout: Duration::from_millis(15_000),
            heartbeat_interval: Duration::from_millis(5_000),
            stale_instance_timeout: Duration::from_millis(30_000),
            rebalance_interval: Duration::from_millis(10_000),
            retry: RetryConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Read `OUTPOST_*` variables from the process environment, then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Self::default();
        let retry_defaults = RetryConfig::default();

        let config = Self {
            instance_id: vars
                .string("OUTPOST_INSTANCE_ID")
                .map(InstanceId::from)
                .unwrap_or(defaults.instance_id),
            hostname: vars
                .string("OUTPOST_HOSTNAME")
                .or_else(|| vars.string("HOSTNAME"))
                .unwrap_or(defaults.hostname),
            port: vars.parse("OUTPOST_PORT", defaults.port)?,
            poll_interval: vars.millis("OUTPOST_POLL_INTERVAL_MS", defaults.poll_interval)?,
            batch_size: vars.parse("OUTPOST_BATCH_SIZE", defaults.batch_size)?,
            max_concurrent_keys: vars
                .parse("OUTPOST_MAX_CONCURRENT_KEYS", defaults.max_concurrent_keys)?,
            stop_on_first_failure: vars
                .flag("OUTPOST_STOP_ON_FIRST_FAILURE", defaults.stop_on_first_failure)?,
            delete_completed: vars.flag("OUTPOST_DELETE_COMPLETED", defaults.delete_completed)?,
            shutdown_timeout: vars
                .millis("OUTPOST_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            heartbeat_interval: vars
                .millis("OUTPOST_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            stale_instance_timeout: vars.millis(
                "OUTPOST_STALE_INSTANCE_TIMEOUT_MS",
                defaults.stale_instance_timeout,
            )?,
            rebalance_interval: vars
                .millis("OUTPOST_REBALANCE_INTERVAL_MS", defaults.rebalance_interval)?,
            retry: RetryConfig {
                kind: vars.parse("OUTPOST_RETRY_POLICY", retry_defaults.kind)?,
                max_retries: vars.parse("OUTPOST_RETRY_MAX_RETRIES", retry_defaults.max_retries)?,
                initial_delay: vars
                    .millis("OUTPOST_RETRY_INITIAL_DELAY_MS", retry_defaults.initial_delay)?,
                max_delay: vars.millis("OUTPOST_RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
                multiplier: vars.parse("OUTPOST_RETRY_MULTIPLIER", retry_defaults.multiplier)?,
                jitter: vars.millis("OUTPOST_RETRY_JITTER_MS", retry_defaults.jitter)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be at least 1".into()));
        }
        if self.max_concurrent_keys == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_keys must be at least 1".into(),
            ));
        }
        if self.stale_instance_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Validation(format!(
                "stale_instance_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.stale_instance_timeout, self.heartbeat_interval
            )));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent_keys(mut self, max: usize) -> Self {
        self.max_concurrent_keys = max;
        self
    }

    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    pub fn with_delete_completed(mut self, delete: bool) -> Self {
        self.delete_completed = delete;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_instance_timeout(mut self, timeout: Duration) -> Self {
        self.stale_instance_timeout = timeout;
        self
    }

    pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
        self.rebalance_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity::new(self.instance_id.clone(), self.hostname.clone(), self.port)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.batch_size,
            stop_on_first_failure: self.stop_on_first_failure,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_millis),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "on" => Ok(true),
                "0" | "false" | "no" | "n" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}
