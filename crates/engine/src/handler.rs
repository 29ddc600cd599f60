//! Handler and fallback dispatch.
//!
//! Handlers are resolved outside the engine: an application registers one
//! callback per handler id at startup ([`HandlerRegistry`]), and the engine
//! only ever sees the [`HandlerInvoker`] / [`FallbackInvoker`] seams.
//! Handlers must be idempotent; delivery is at-least-once.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use outpost_core::{OutboxRecord, RecordId};

/// Failure raised by a handler or fallback.
///
/// `kind` is a short classifier (e.g. `"timeout"`, `"validation"`) that retry
/// policies match on to decide whether the failure is transient.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    kind: String,
    message: String,
}

impl HandlerError {
    pub const HANDLER_NOT_FOUND: &'static str = "handler_not_found";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Record metadata handed to handlers alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerMetadata {
    pub handler_id: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub context: BTreeMap<String, String>,
}

impl HandlerMetadata {
    pub fn for_record(record: &OutboxRecord) -> Self {
        Self {
            handler_id: record.handler_id().to_string(),
            key: record.key().to_string(),
            created_at: record.created_at(),
            context: record.context().clone(),
        }
    }
}

/// What a fallback learns about the primary handler's failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub record_id: RecordId,
    pub key: String,
    pub handler_id: String,
    /// Failure count including the failure that triggered the fallback.
    pub failure_count: u32,
    pub last_error: HandlerError,
    pub retries_exhausted: bool,
    pub non_retryable: bool,
    pub created_at: DateTime<Utc>,
}

/// Primary dispatch seam.
pub trait HandlerInvoker: Send + Sync {
    fn dispatch(&self, payload: &JsonValue, metadata: &HandlerMetadata) -> Result<(), HandlerError>;
}

/// Fallback dispatch seam.
pub trait FallbackInvoker: Send + Sync {
    /// `Ok(true)` when a fallback handled the record, `Ok(false)` when none is
    /// registered for it.
    fn dispatch(
        &self,
        payload: &JsonValue,
        metadata: &HandlerMetadata,
        failure: &FailureContext,
    ) -> Result<bool, HandlerError>;
}

/// Handler function type.
pub type HandlerFn = Box<dyn Fn(&JsonValue, &HandlerMetadata) -> Result<(), HandlerError> + Send + Sync>;

/// Fallback function type.
pub type FallbackFn = Box<
    dyn Fn(&JsonValue, &HandlerMetadata, &FailureContext) -> Result<(), HandlerError> + Send + Sync,
>;

/// Startup-time lookup table from handler id to callbacks.
///
/// Built once, then shared (`Arc`) with the record processor.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
    fallbacks: HashMap<String, FallbackFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `handler_id`. A later registration replaces an
    /// earlier one.
    pub fn register<F>(&mut self, handler_id: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&JsonValue, &HandlerMetadata) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(handler_id.into(), Box::new(handler));
        self
    }

    /// Register the fallback run when `handler_id` fails permanently.
    pub fn register_fallback<F>(&mut self, handler_id: impl Into<String>, fallback: F) -> &mut Self
    where
        F: Fn(&JsonValue, &HandlerMetadata, &FailureContext) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.fallbacks.insert(handler_id.into(), Box::new(fallback));
        self
    }

    pub fn handler_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_ids())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl HandlerInvoker for HandlerRegistry {
    fn dispatch(&self, payload: &JsonValue, metadata: &HandlerMetadata) -> Result<(), HandlerError> {
        let handler = self.handlers.get(&metadata.handler_id).ok_or_else(|| {
            HandlerError::new(
                HandlerError::HANDLER_NOT_FOUND,
                format!("no handler registered for '{}'", metadata.handler_id),
            )
        })?;
        handler(payload, metadata)
    }
}

impl FallbackInvoker for HandlerRegistry {
    fn dispatch(
        &self,
        payload: &JsonValue,
        metadata: &HandlerMetadata,
        failure: &FailureContext,
    ) -> Result<bool, HandlerError> {
        match self.fallbacks.get(&metadata.handler_id) {
            Some(fallback) => fallback(payload, metadata, failure).map(|()| true),
            None => Ok(false),
        }
    }
}
