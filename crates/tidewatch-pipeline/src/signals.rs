//! Stage signal table: upstream systems record readiness facts
//! ("entity 5 has an enrichment record") and the pipeline reads them as
//! [`StageSignal`] predicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tidewatch_core::clock::to_millis;
use tidewatch_core::error::Result;
use tidewatch_core::traits::StageSignal;
use tidewatch_core::types::PipelineStage;

use crate::db::{PipelineDb, db_err};

impl PipelineDb {
    /// Record that the readiness condition for `stage` holds for `entity_id`.
    pub fn record_signal(
        &self,
        entity_id: &str,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO pipeline_signals (entity_id, stage, recorded_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id, stage) DO UPDATE SET recorded_at = excluded.recorded_at",
                params![entity_id, stage.as_str(), to_millis(now)],
            )
            .map_err(db_err("Record signal"))?;
        tracing::debug!(entity_id, stage = %stage, "📥 Signal recorded");
        Ok(())
    }

    pub fn clear_signal(&self, entity_id: &str, stage: PipelineStage) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM pipeline_signals WHERE entity_id = ?1 AND stage = ?2",
                params![entity_id, stage.as_str()],
            )
            .map_err(db_err("Clear signal"))?;
        Ok(())
    }

    /// Stages whose signal currently holds for the entity, in pipeline order.
    pub fn signals_for(&self, entity_id: &str) -> Result<Vec<PipelineStage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT stage FROM pipeline_signals WHERE entity_id = ?1")
            .map_err(db_err("Load signals"))?;
        let rows = stmt
            .query_map([entity_id], |r| r.get::<_, String>(0))
            .map_err(db_err("Load signals"))?;
        let mut stages = Vec::new();
        for row in rows {
            if let Ok(stage) = row.map_err(db_err("Load signals"))?.parse::<PipelineStage>() {
                stages.push(stage);
            }
        }
        stages.sort();
        Ok(stages)
    }

    fn signal_holds(&self, entity_id: &str, stage: PipelineStage) -> Result<bool> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM pipeline_signals WHERE entity_id = ?1 AND stage = ?2",
                params![entity_id, stage.as_str()],
                |r| r.get(0),
            )
            .map_err(db_err("Read signal"))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl StageSignal for PipelineDb {
    async fn holds(&self, stage: PipelineStage, entity_id: &str) -> Result<bool> {
        self.signal_holds(entity_id, stage)
    }
}
