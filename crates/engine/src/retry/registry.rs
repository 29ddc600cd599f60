use std::collections::HashMap;
use std::sync::Arc;

use super::RetryPolicy;

/// Resolves the retry policy for a handler: per-handler override, else default.
///
/// Built once at startup and shared; there is no process-global policy table.
#[derive(Debug, Clone)]
pub struct RetryPolicyRegistry {
    default: Arc<dyn RetryPolicy>,
    overrides: HashMap<String, Arc<dyn RetryPolicy>>,
}

impl RetryPolicyRegistry {
    pub fn new(default: Arc<dyn RetryPolicy>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, handler_id: impl Into<String>, policy: Arc<dyn RetryPolicy>) -> Self {
        self.register(handler_id, policy);
        self
    }

    pub fn register(&mut self, handler_id: impl Into<String>, policy: Arc<dyn RetryPolicy>) {
        self.overrides.insert(handler_id.into(), policy);
    }

    pub fn resolve(&self, handler_id: &str) -> Arc<dyn RetryPolicy> {
        self.overrides
            .get(handler_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
