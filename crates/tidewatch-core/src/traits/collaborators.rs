//! Pipeline collaborator interfaces. Implementations live outside the core.

use async_trait::async_trait;
use chrono::Duration;

use crate::error::Result;
use crate::types::PipelineStage;

/// Data-readiness predicate gating entry into `stage`.
#[async_trait]
pub trait StageSignal: Send + Sync {
    async fn holds(&self, stage: PipelineStage, entity_id: &str) -> Result<bool>;
}

/// Maximum dwell time per stage before an entity is flagged stale.
pub trait StaleThreshold: Send + Sync {
    /// `None` disables stale detection for the stage.
    fn threshold(&self, stage: PipelineStage) -> Option<Duration>;
}

/// Invoked after a successful automatic advance. Failures are logged and
/// never roll back the stage change.
#[async_trait]
pub trait TransitionHook: Send + Sync {
    async fn on_transition(
        &self,
        entity_id: &str,
        from: PipelineStage,
        to: PipelineStage,
    ) -> Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransitionHook;

#[async_trait]
impl TransitionHook for NoopTransitionHook {
    async fn on_transition(&self, _: &str, _: PipelineStage, _: PipelineStage) -> Result<()> {
        Ok(())
    }
}
