//! Job definitions: the core data model for scheduled work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tidewatch_core::clock::{MAX_DURATION_SECS, checked_secs};
use tidewatch_core::config::SchedulerConfig;
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::types::CheckStatus;

use crate::cron::CronExpr;

/// How/when the job triggers. Exactly one form per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run every N seconds.
    Interval { every_secs: u64 },
    /// Run on a five-field cron expression (UTC).
    Cron { expression: String },
}

impl Schedule {
    pub fn every(secs: u64) -> Self {
        Schedule::Interval { every_secs: secs }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    /// Registration-time validation. Invalid schedules never reach the store.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Interval { every_secs: 0 } => Err(TidewatchError::ScheduleConfig(
                "interval must be at least 1 second".into(),
            )),
            Schedule::Interval { every_secs } if *every_secs > MAX_DURATION_SECS => {
                Err(TidewatchError::ScheduleConfig(format!(
                    "interval {every_secs}s exceeds the {MAX_DURATION_SECS}s limit"
                )))
            }
            Schedule::Interval { .. } => Ok(()),
            Schedule::Cron { expression } => CronExpr::parse(expression).map(|_| ()),
        }
    }

    /// Next due time: `after + interval`, or the first cron match `>= after`.
    pub fn next_due(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Schedule::Interval { every_secs } => checked_secs(*every_secs)
                .and_then(|every| after.checked_add_signed(every))
                .ok_or_else(|| {
                    TidewatchError::ScheduleConfig(format!(
                        "interval {every_secs}s overflows the calendar from {after}"
                    ))
                }),
            Schedule::Cron { expression } => CronExpr::parse(expression)?
                .next_after(after)
                .ok_or_else(|| {
                    TidewatchError::ScheduleConfig(format!(
                        "cron expression '{expression}' has no upcoming run"
                    ))
                }),
        }
    }

    /// Next normal-cadence run after an execution that started at
    /// `started_at` and finished at `now`. Always strictly later than
    /// `started_at`.
    pub fn next_after_run(
        &self,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let next = self.next_due(now)?;
        if next > started_at {
            Ok(next)
        } else {
            self.next_due(started_at + Duration::seconds(1))
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Schedule::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

/// Job run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    /// Repeated failures past the retry ceiling; still runs on its normal cadence.
    Degraded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "degraded" => JobStatus::Degraded,
            _ => JobStatus::Idle,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of the most recent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunResult {
    pub status: CheckStatus,
    /// `None` on success; `handler_error` / `timeout` on failure.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

/// A scheduled job: definition plus persisted run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Stable job ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub schedule: Schedule,
    /// Resolved through the handler registry, never stored as code.
    pub handler_ref: String,
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub timeout_secs: u64,

    pub next_run_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    /// Consecutive failures; reset to 0 on success.
    pub retry_count: u32,
    pub status: JobStatus,
    /// A manual run was requested and has not been claimed yet.
    pub run_requested: bool,
    pub last_result: Option<JobRunResult>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// New enabled job with the built-in retry defaults (3 retries, 30s base, 60s timeout).
    /// `next_run_at` is set at registration.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        schedule: Schedule,
        handler_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schedule,
            handler_ref: handler_ref.into(),
            enabled: true,
            max_retries: 3,
            backoff_base_secs: 30,
            timeout_secs: 60,
            next_run_at: DateTime::<Utc>::UNIX_EPOCH,
            leased_until: None,
            leased_by: None,
            retry_count: 0,
            status: JobStatus::Idle,
            run_requested: false,
            last_result: None,
            last_run_at: None,
            last_success_at: None,
        }
    }

    /// Apply the configured retry/timeout defaults.
    pub fn with_defaults(mut self, config: &SchedulerConfig) -> Self {
        self.max_retries = config.default_max_retries;
        self.backoff_base_secs = config.default_backoff_base_secs;
        self.timeout_secs = config.default_timeout_secs;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base_secs: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_secs = backoff_base_secs;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Registration-time checks on the schedule and every duration field.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TidewatchError::ScheduleConfig("job id must not be empty".into()));
        }
        self.schedule.validate()?;
        for (field, secs) in [
            ("timeout_secs", self.timeout_secs),
            ("backoff_base_secs", self.backoff_base_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(TidewatchError::ScheduleConfig(format!(
                    "job '{}': {field} = {secs} exceeds the {MAX_DURATION_SECS}s limit",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Whether an unexpired lease is held at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until >= now)
    }

    /// Due for a claim at `now`: enabled, time reached or run requested, lease free.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && (self.next_run_at <= now || self.run_requested) && !self.is_leased(now)
    }
}
