//! SQLite-backed persistence for jobs, action item emissions, check tiers,
//! and heartbeat cycle reports. Timestamps are epoch milliseconds so lease
//! and due-time comparisons happen in SQL.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tidewatch_core::clock::{from_millis, to_millis};
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::types::{ActionItem, HeartbeatCycleReport};

use crate::jobs::{JobRunResult, JobStatus, Schedule, ScheduledJob};
use crate::store::{ActionLedger, Completion, CycleStore, JobStore, LedgerEntry};

const JOB_COLUMNS: &str = "id, name, schedule, handler_ref, enabled, max_retries, backoff_base_secs,
     timeout_secs, next_run_at, leased_until, leased_by, retry_count, status, run_requested,
     last_result, last_run_at, last_success_at";

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("busy timeout"))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(db_err("journal mode"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Job definitions and run state
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schedule TEXT NOT NULL,            -- JSON: {type: interval|cron, ...}
                handler_ref TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                max_retries INTEGER NOT NULL DEFAULT 3,
                backoff_base_secs INTEGER NOT NULL DEFAULT 30,
                timeout_secs INTEGER NOT NULL DEFAULT 60,
                next_run_at INTEGER NOT NULL,
                leased_until INTEGER,
                leased_by TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'idle',
                run_requested INTEGER NOT NULL DEFAULT 0,
                last_result TEXT,                  -- JSON JobRunResult
                last_run_at INTEGER,
                last_success_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(enabled, next_run_at);

            -- Action item emission ledger (cooldown dedupe)
            CREATE TABLE IF NOT EXISTS action_items (
                key TEXT PRIMARY KEY,
                priority TEXT NOT NULL,
                message TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                last_emitted_at INTEGER,
                times_seen INTEGER NOT NULL DEFAULT 1
            );

            -- Heartbeat check tiers
            CREATE TABLE IF NOT EXISTS check_runs (
                name TEXT PRIMARY KEY,
                tier_seconds INTEGER NOT NULL,
                last_run_at INTEGER
            );

            -- Heartbeat cycle reports
            CREATE TABLE IF NOT EXISTS cycle_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                report TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TidewatchError::Persistence("scheduler db lock poisoned".into()))
    }
}

// ─── Jobs ──────────────────────────────────────

impl JobStore for SchedulerDb {
    fn upsert_job(&self, job: &ScheduledJob) -> Result<ScheduledJob> {
        let schedule = serde_json::to_string(&job.schedule)?;
        self.conn()?
            .execute(
                "INSERT INTO jobs (id, name, schedule, handler_ref, enabled, max_retries,
                     backoff_base_secs, timeout_secs, next_run_at, retry_count, status, run_requested)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 'idle', 0)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     schedule = excluded.schedule,
                     handler_ref = excluded.handler_ref,
                     enabled = excluded.enabled,
                     max_retries = excluded.max_retries,
                     backoff_base_secs = excluded.backoff_base_secs,
                     timeout_secs = excluded.timeout_secs",
                params![
                    job.id,
                    job.name,
                    schedule,
                    job.handler_ref,
                    job.enabled as i32,
                    job.max_retries,
                    job.backoff_base_secs as i64,
                    job.timeout_secs as i64,
                    to_millis(job.next_run_at),
                ],
            )
            .map_err(db_err("Save job"))?;
        self.get_job(&job.id)?
            .ok_or_else(|| TidewatchError::Persistence(format!("job '{}' vanished after upsert", job.id)))
    }

    fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()
        .map_err(db_err("Load job"))
    }

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))
            .map_err(db_err("List jobs"))?;
        let rows = stmt.query_map([], row_to_job).map_err(db_err("List jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List jobs"))
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE enabled = 1
                   AND (next_run_at <= ?1 OR run_requested = 1)
                   AND (leased_until IS NULL OR leased_until < ?1)
                 ORDER BY run_requested DESC, next_run_at"
            ))
            .map_err(db_err("Due jobs"))?;
        let rows = stmt
            .query_map([to_millis(now)], row_to_job)
            .map_err(db_err("Due jobs"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Due jobs"))
    }

    fn try_claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE jobs
                 SET leased_until = ?3, leased_by = ?2,
                     status = CASE WHEN status = 'degraded' THEN 'degraded' ELSE 'running' END,
                     run_requested = 0, last_run_at = ?4
                 WHERE id = ?1
                   AND enabled = 1
                   AND (next_run_at <= ?4 OR run_requested = 1)
                   AND (leased_until IS NULL OR leased_until < ?4)",
                params![id, worker_id, to_millis(lease_until), to_millis(now)],
            )
            .map_err(db_err("Claim job"))?;
        Ok(changed == 1)
    }

    fn complete(&self, id: &str, worker_id: &str, completion: &Completion) -> Result<bool> {
        let result = serde_json::to_string(&completion.result)?;
        let changed = self
            .conn()?
            .execute(
                "UPDATE jobs
                 SET next_run_at = ?3, retry_count = ?4, status = ?5, last_result = ?6,
                     last_success_at = CASE WHEN ?7 = 1 THEN ?8 ELSE last_success_at END,
                     leased_until = NULL, leased_by = NULL
                 WHERE id = ?1 AND leased_by = ?2",
                params![
                    id,
                    worker_id,
                    to_millis(completion.next_run_at),
                    completion.retry_count,
                    completion.status.as_str(),
                    result,
                    completion.success as i32,
                    to_millis(completion.finished_at),
                ],
            )
            .map_err(db_err("Complete job"))?;
        Ok(changed == 1)
    }

    fn request_run_now(&self, id: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute("UPDATE jobs SET run_requested = 1 WHERE id = ?1", [id])
            .map_err(db_err("Run now"))?;
        if changed == 0 {
            return Err(TidewatchError::NotFound(format!("job '{id}'")));
        }
        Ok(())
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE jobs SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i32],
            )
            .map_err(db_err("Enable job"))?;
        if changed == 0 {
            return Err(TidewatchError::NotFound(format!("job '{id}'")));
        }
        Ok(())
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let schedule_json: String = row.get(2)?;
    let schedule: Schedule = serde_json::from_str(&schedule_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_result: Option<String> = row.get(14)?;
    let last_result: Option<JobRunResult> =
        last_result.and_then(|s| serde_json::from_str(&s).ok());
    let status: String = row.get(12)?;

    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule,
        handler_ref: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        max_retries: row.get(5)?,
        backoff_base_secs: row.get::<_, i64>(6)? as u64,
        timeout_secs: row.get::<_, i64>(7)? as u64,
        next_run_at: from_millis(row.get(8)?),
        leased_until: row.get::<_, Option<i64>>(9)?.map(from_millis),
        leased_by: row.get(10)?,
        retry_count: row.get(11)?,
        status: JobStatus::parse(&status),
        run_requested: row.get::<_, i32>(13)? != 0,
        last_result,
        last_run_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
        last_success_at: row.get::<_, Option<i64>>(16)?.map(from_millis),
    })
}

// ─── Action item ledger ──────────────────────────────────────

impl ActionLedger for SchedulerDb {
    fn observe(&self, item: &ActionItem, now: DateTime<Utc>) -> Result<LedgerEntry> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO action_items (key, priority, message, source, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 priority = excluded.priority,
                 message = excluded.message,
                 source = excluded.source,
                 last_seen_at = excluded.last_seen_at,
                 times_seen = times_seen + 1",
            params![
                item.key,
                item.priority.as_str(),
                item.message,
                item.source,
                to_millis(now)
            ],
        )
        .map_err(db_err("Observe action item"))?;

        let (first_seen, last_emitted): (i64, Option<i64>) = conn
            .query_row(
                "SELECT first_seen_at, last_emitted_at FROM action_items WHERE key = ?1",
                [&item.key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(db_err("Observe action item"))?;

        Ok(LedgerEntry {
            key: item.key.clone(),
            first_seen_at: from_millis(first_seen),
            last_emitted_at: last_emitted.map(from_millis),
        })
    }

    fn try_claim_emission(
        &self,
        key: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE action_items SET last_emitted_at = ?2
                 WHERE key = ?1 AND (last_emitted_at IS NULL OR last_emitted_at <= ?3)",
                params![key, to_millis(now), to_millis(now - cooldown)],
            )
            .map_err(db_err("Claim emission"))?;
        Ok(changed == 1)
    }
}

// ─── Heartbeat state ──────────────────────────────────────

impl CycleStore for SchedulerDb {
    fn upsert_check(&self, name: &str, tier_seconds: u64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO check_runs (name, tier_seconds) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET tier_seconds = excluded.tier_seconds",
            params![name, tier_seconds as i64],
        )
        .map_err(db_err("Register check"))?;
        let last: Option<i64> = conn
            .query_row(
                "SELECT last_run_at FROM check_runs WHERE name = ?1",
                [name],
                |r| r.get(0),
            )
            .map_err(db_err("Register check"))?;
        Ok(last.map(from_millis))
    }

    fn record_check_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE check_runs SET last_run_at = ?2 WHERE name = ?1",
                params![name, to_millis(at)],
            )
            .map_err(db_err("Record check run"))?;
        Ok(())
    }

    fn save_report(&self, report: &HeartbeatCycleReport, keep: usize) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cycle_reports (cycle_id, started_at, report) VALUES (?1, ?2, ?3)",
            params![report.cycle_id, to_millis(report.started_at), json],
        )
        .map_err(db_err("Save report"))?;
        conn.execute(
            "DELETE FROM cycle_reports WHERE id NOT IN
                (SELECT id FROM cycle_reports ORDER BY id DESC LIMIT ?1)",
            [keep.max(1) as i64],
        )
        .map_err(db_err("Trim reports"))?;
        Ok(())
    }

    fn last_report(&self) -> Result<Option<HeartbeatCycleReport>> {
        Ok(self.recent_reports(1)?.into_iter().next())
    }

    fn recent_reports(&self, limit: usize) -> Result<Vec<HeartbeatCycleReport>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT report FROM cycle_reports ORDER BY id DESC LIMIT ?1")
            .map_err(db_err("Load reports"))?;
        let rows = stmt
            .query_map([limit as i64], |r| r.get::<_, String>(0))
            .map_err(db_err("Load reports"))?;
        let mut reports = Vec::new();
        for row in rows {
            let json = row.map_err(db_err("Load reports"))?;
            match serde_json::from_str(&json) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable cycle report: {e}"),
            }
        }
        Ok(reports)
    }
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> TidewatchError {
    move |e| TidewatchError::Persistence(format!("{context}: {e}"))
}
