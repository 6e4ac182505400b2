//! Check trait: one named unit of monitoring work inside a heartbeat cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::CheckResult;

/// Context handed to a check for one invocation.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub cycle_id: String,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait Check: Send + Sync {
    /// Stable name, also the key for tier configuration.
    fn name(&self) -> &str;

    /// Run the check. An `Err` is recorded as an `error` result and never
    /// aborts the rest of the cycle.
    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult>;
}
