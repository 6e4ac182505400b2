//! Handler registry: maps a job's `handler_ref` to executable code.
//! Jobs persist only the reference; handlers are registered at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::types::CheckResult;

/// What a handler knows about the run it is executing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    /// 1 for a first attempt, `retry_count + 1` afterwards.
    pub attempt: u32,
}

/// Executable unit of work. Returning `Err` (or exceeding the job timeout)
/// is a failure; any `Ok` result, including `action_needed`, is a success.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<CheckResult>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler behind `handler_ref`.
    pub fn register(&mut self, handler_ref: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let handler_ref = handler_ref.into();
        tracing::debug!("🔧 Handler registered: {handler_ref}");
        self.handlers.insert(handler_ref, handler);
    }

    pub fn with(mut self, handler_ref: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler_ref, handler);
        self
    }

    pub fn get(&self, handler_ref: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_ref).cloned()
    }

    pub fn contains(&self, handler_ref: &str) -> bool {
        self.handlers.contains_key(handler_ref)
    }

    /// Resolve or fail with a configuration error.
    pub fn resolve(&self, handler_ref: &str) -> Result<Arc<dyn JobHandler>> {
        self.get(handler_ref).ok_or_else(|| {
            TidewatchError::ScheduleConfig(format!("no handler registered for '{handler_ref}'"))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
