//! Storage seams for the scheduler. [`crate::persistence::SchedulerDb`] is the
//! SQLite implementation; every mutation that two schedulers could race on
//! is a single-row conditional write.

use chrono::{DateTime, Duration, Utc};
use tidewatch_core::error::Result;
use tidewatch_core::types::{ActionItem, HeartbeatCycleReport};

use crate::jobs::{JobRunResult, JobStatus, ScheduledJob};

/// Final state written when a leased execution finishes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: JobStatus,
    pub result: JobRunResult,
}

/// Persisted table of job definitions and run state.
pub trait JobStore: Send + Sync {
    /// Idempotent registration. Definition fields are overwritten; run state
    /// (`next_run_at`, lease, retry count, results) of an existing row is kept.
    /// Returns the stored row.
    fn upsert_job(&self, job: &ScheduledJob) -> Result<ScheduledJob>;

    fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>>;

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>>;

    /// Enabled jobs whose time has come (or that were asked to run now) and
    /// whose lease is free or expired.
    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>>;

    /// Conditional lease claim. Succeeds for exactly one concurrent caller.
    fn try_claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Write the outcome and release the lease, only if `worker_id` still
    /// holds it. Returns `false` when the lease was lost.
    fn complete(&self, id: &str, worker_id: &str, completion: &Completion) -> Result<bool>;

    /// Flag a job to run at the next claim opportunity.
    fn request_run_now(&self, id: &str) -> Result<()>;

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()>;
}

/// Emission bookkeeping for action item cooldowns.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_emitted_at: Option<DateTime<Utc>>,
}

pub trait ActionLedger: Send + Sync {
    /// Record a sighting; creates the row on first sight.
    fn observe(&self, item: &ActionItem, now: DateTime<Utc>) -> Result<LedgerEntry>;

    /// Atomically take the right to deliver `key` at `now`. `false` while
    /// the previous emission is younger than `cooldown`.
    fn try_claim_emission(&self, key: &str, now: DateTime<Utc>, cooldown: Duration)
    -> Result<bool>;
}

/// Heartbeat bookkeeping: per-check tier state and cycle reports.
pub trait CycleStore: Send + Sync {
    /// Idempotent check registration. Returns the persisted `last_run_at`.
    fn upsert_check(&self, name: &str, tier_seconds: u64) -> Result<Option<DateTime<Utc>>>;

    fn record_check_run(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    /// Persist a report and trim history to `keep` entries.
    fn save_report(&self, report: &HeartbeatCycleReport, keep: usize) -> Result<()>;

    fn last_report(&self) -> Result<Option<HeartbeatCycleReport>>;

    fn recent_reports(&self, limit: usize) -> Result<Vec<HeartbeatCycleReport>>;
}
