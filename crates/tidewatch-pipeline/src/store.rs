//! Tracked entity state and the storage seam for it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tidewatch_core::clock::checked_secs;
use tidewatch_core::error::Result;
use tidewatch_core::types::PipelineStage;

/// Lifecycle state of one entity under management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntityPipelineState {
    pub entity_id: String,
    pub stage: PipelineStage,
    pub stage_changed_at: DateTime<Utc>,
    pub manual_override_at: Option<DateTime<Utc>>,
    pub override_grace_secs: u64,
    /// Entities leaving management are deactivated, never deleted.
    pub active: bool,
    /// Bumped by every write; automatic advances are conditional on it.
    pub version: i64,
}

impl TrackedEntityPipelineState {
    /// Automatic advancement is suspended while inside the override grace window.
    pub fn in_override_grace(&self, now: DateTime<Utc>) -> bool {
        self.manual_override_at.is_some_and(|at| {
            // An out-of-range grace never expires.
            checked_secs(self.override_grace_secs).is_none_or(|grace| now - at < grace)
        })
    }

    /// Time spent in the current stage.
    pub fn dwell(&self, now: DateTime<Utc>) -> Duration {
        now - self.stage_changed_at
    }
}

pub trait PipelineStore: Send + Sync {
    /// Start managing an entity at `NEW`. Idempotent: an existing entity keeps
    /// its stage and is re-activated.
    fn track(&self, entity_id: &str, now: DateTime<Utc>) -> Result<TrackedEntityPipelineState>;

    /// Stop managing an entity (mark inactive).
    fn untrack(&self, entity_id: &str) -> Result<()>;

    fn get(&self, entity_id: &str) -> Result<Option<TrackedEntityPipelineState>>;

    fn list_active(&self) -> Result<Vec<TrackedEntityPipelineState>>;

    /// External override: set any stage (including backwards) and stamp
    /// `manual_override_at = now`. Creates the entity if unknown.
    fn set_manual_stage(
        &self,
        entity_id: &str,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<TrackedEntityPipelineState>;

    /// Conditional single-step advance. `false` if the row changed since it
    /// was read (version or stage mismatch) or the entity is inactive.
    fn advance(
        &self,
        entity_id: &str,
        from: PipelineStage,
        to: PipelineStage,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}
