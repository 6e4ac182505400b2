//! SQLite store for pipeline state and stage signals.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tidewatch_core::clock::{from_millis, to_millis};
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::types::PipelineStage;

use crate::store::{PipelineStore, TrackedEntityPipelineState};

const STATE_COLUMNS: &str =
    "entity_id, stage, stage_changed_at, manual_override_at, override_grace_secs, active, version";

/// Pipeline database. Can share a file with the scheduler database.
pub struct PipelineDb {
    conn: Mutex<Connection>,
    override_grace_secs: u64,
}

impl PipelineDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("busy timeout"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pipeline_states (
                entity_id TEXT PRIMARY KEY,
                stage TEXT NOT NULL DEFAULT 'NEW',
                stage_changed_at INTEGER NOT NULL,
                manual_override_at INTEGER,
                override_grace_secs INTEGER NOT NULL DEFAULT 86400,
                active INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_active ON pipeline_states(active);

            -- Readiness facts written by upstream systems
            CREATE TABLE IF NOT EXISTS pipeline_signals (
                entity_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (entity_id, stage)
            );
        ",
        )
        .map_err(db_err("Migration"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            override_grace_secs: 86_400,
        })
    }

    /// Grace window stamped on entities created or overridden from now on.
    pub fn with_override_grace(mut self, secs: u64) -> Self {
        self.override_grace_secs = secs;
        self
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TidewatchError::Persistence("pipeline db lock poisoned".into()))
    }
}

impl PipelineStore for PipelineDb {
    fn track(&self, entity_id: &str, now: DateTime<Utc>) -> Result<TrackedEntityPipelineState> {
        self.conn()?
            .execute(
                "INSERT INTO pipeline_states
                    (entity_id, stage, stage_changed_at, override_grace_secs, active, version, created_at)
                 VALUES (?1, 'NEW', ?2, ?3, 1, 0, ?2)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    active = 1,
                    version = CASE WHEN active = 0 THEN version + 1 ELSE version END",
                params![entity_id, to_millis(now), self.override_grace_secs as i64],
            )
            .map_err(db_err("Track entity"))?;
        tracing::debug!(entity_id, "📌 Entity tracked");
        self.get(entity_id)?.ok_or_else(|| {
            TidewatchError::Persistence(format!("entity '{entity_id}' vanished after insert"))
        })
    }

    fn untrack(&self, entity_id: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE pipeline_states SET active = 0, version = version + 1 WHERE entity_id = ?1",
                [entity_id],
            )
            .map_err(db_err("Untrack entity"))?;
        if changed == 0 {
            return Err(TidewatchError::NotFound(format!("entity '{entity_id}'")));
        }
        Ok(())
    }

    fn get(&self, entity_id: &str) -> Result<Option<TrackedEntityPipelineState>> {
        self.conn()?
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM pipeline_states WHERE entity_id = ?1"),
                [entity_id],
                row_to_state,
            )
            .optional()
            .map_err(db_err("Load entity"))
    }

    fn list_active(&self) -> Result<Vec<TrackedEntityPipelineState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STATE_COLUMNS} FROM pipeline_states WHERE active = 1 ORDER BY entity_id"
            ))
            .map_err(db_err("List entities"))?;
        let rows = stmt
            .query_map([], row_to_state)
            .map_err(db_err("List entities"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List entities"))
    }

    fn set_manual_stage(
        &self,
        entity_id: &str,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<TrackedEntityPipelineState> {
        self.conn()?
            .execute(
                "INSERT INTO pipeline_states
                    (entity_id, stage, stage_changed_at, manual_override_at, override_grace_secs,
                     active, version, created_at)
                 VALUES (?1, ?2, ?3, ?3, ?4, 1, 0, ?3)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    stage = excluded.stage,
                    stage_changed_at = excluded.stage_changed_at,
                    manual_override_at = excluded.manual_override_at,
                    override_grace_secs = excluded.override_grace_secs,
                    active = 1,
                    version = version + 1",
                params![
                    entity_id,
                    stage.as_str(),
                    to_millis(now),
                    self.override_grace_secs as i64
                ],
            )
            .map_err(db_err("Set stage"))?;
        tracing::info!(entity_id, stage = %stage, "✋ Manual stage override");
        self.get(entity_id)?.ok_or_else(|| {
            TidewatchError::Persistence(format!("entity '{entity_id}' vanished after override"))
        })
    }

    fn advance(
        &self,
        entity_id: &str,
        from: PipelineStage,
        to: PipelineStage,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE pipeline_states
                 SET stage = ?3, stage_changed_at = ?5, version = version + 1
                 WHERE entity_id = ?1 AND stage = ?2 AND version = ?4 AND active = 1",
                params![
                    entity_id,
                    from.as_str(),
                    to.as_str(),
                    expected_version,
                    to_millis(now)
                ],
            )
            .map_err(db_err("Advance stage"))?;
        Ok(changed == 1)
    }
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<TrackedEntityPipelineState> {
    let stage: String = row.get(1)?;
    let stage = stage.parse::<PipelineStage>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(TrackedEntityPipelineState {
        entity_id: row.get(0)?,
        stage,
        stage_changed_at: from_millis(row.get(2)?),
        manual_override_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        override_grace_secs: row.get::<_, i64>(4)?.max(0) as u64,
        active: row.get::<_, i32>(5)? != 0,
        version: row.get(6)?,
    })
}

pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> TidewatchError {
    move |e| TidewatchError::Persistence(format!("{context}: {e}"))
}
