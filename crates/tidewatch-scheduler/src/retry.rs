//! Retry/backoff controller: decides what happens to a job after a run.
//!
//! Failures grow `retry_count`; while it is within `max_retries` the next
//! attempt is pulled in to `now + base * 2^(retry_count - 1)`. The failure
//! that brings the count to `max_retries` marks the job degraded and raises
//! a single alert. Past the ceiling the job keeps failing on its normal
//! cadence. Any success resets the count.

use chrono::{DateTime, Duration, Utc};
use tidewatch_core::error::Result;

use crate::jobs::{JobStatus, ScheduledJob};

/// Upper bound on a single backoff delay (7 days).
const MAX_BACKOFF_SECS: u64 = 7 * 24 * 3600;

/// Retry parameters of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
}

/// State to persist after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDecision {
    pub retry_count: u32,
    pub status: JobStatus,
    pub next_run_at: DateTime<Utc>,
    /// This failure crossed the retry ceiling; raise the degraded alert.
    pub newly_degraded: bool,
}

impl RetryPolicy {
    pub fn for_job(job: &ScheduledJob) -> Self {
        Self {
            max_retries: job.max_retries,
            backoff_base_secs: job.backoff_base_secs,
        }
    }

    /// Delay before attempt `retry_count + 1`: `base * 2^(retry_count - 1)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let secs = self
            .backoff_base_secs
            .saturating_mul(factor)
            .min(MAX_BACKOFF_SECS);
        Duration::seconds(secs as i64)
    }

    pub fn on_success(
        &self,
        job: &ScheduledJob,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RunDecision> {
        Ok(RunDecision {
            retry_count: 0,
            status: JobStatus::Idle,
            next_run_at: job.schedule.next_after_run(started_at, now)?,
            newly_degraded: false,
        })
    }

    pub fn on_failure(
        &self,
        job: &ScheduledJob,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RunDecision> {
        let retry_count = job.retry_count.saturating_add(1);

        let next_run_at = if retry_count <= self.max_retries {
            now + self.backoff_delay(retry_count)
        } else {
            job.schedule.next_after_run(started_at, now)?
        };

        let status = if retry_count >= self.max_retries {
            JobStatus::Degraded
        } else {
            JobStatus::Idle
        };

        Ok(RunDecision {
            retry_count,
            status,
            next_run_at,
            newly_degraded: retry_count == self.max_retries
                || (self.max_retries == 0 && retry_count == 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Schedule;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(n)
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base_secs: 30,
        };
        assert_eq!(policy.backoff_delay(1), Duration::seconds(30));
        assert_eq!(policy.backoff_delay(2), Duration::seconds(60));
        assert_eq!(policy.backoff_delay(3), Duration::seconds(120));
        assert_eq!(policy.backoff_delay(200), Duration::seconds(MAX_BACKOFF_SECS as i64));
    }

    #[test]
    fn test_failure_sequence_reaches_degraded_once() {
        let mut job = ScheduledJob::new("scan", "scan", Schedule::every(3600), "h")
            .with_retries(3, 30);
        let policy = RetryPolicy::for_job(&job);

        // Fails at t=0, 30, 90: retries at 30, 90, 210.
        let mut at = secs(0);
        let mut alerts = 0;
        for expected in [30, 90, 210] {
            let d = policy.on_failure(&job, at, at).unwrap();
            assert_eq!(d.next_run_at, secs(expected));
            alerts += d.newly_degraded as u32;
            job.retry_count = d.retry_count;
            job.status = d.status;
            at = d.next_run_at;
        }
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.status, JobStatus::Degraded);
        assert_eq!(alerts, 1);

        // Fourth failure: stays degraded, normal cadence, no second alert.
        let d = policy.on_failure(&job, at, at).unwrap();
        assert_eq!(d.status, JobStatus::Degraded);
        assert_eq!(d.next_run_at, at + Duration::seconds(3600));
        assert!(!d.newly_degraded);
    }

    #[test]
    fn test_success_resets() {
        let mut job = ScheduledJob::new("scan", "scan", Schedule::every(300), "h");
        job.retry_count = 4;
        job.status = JobStatus::Degraded;
        let d = RetryPolicy::for_job(&job)
            .on_success(&job, secs(0), secs(5))
            .unwrap();
        assert_eq!(d.retry_count, 0);
        assert_eq!(d.status, JobStatus::Idle);
        assert_eq!(d.next_run_at, secs(305));
    }

    #[test]
    fn test_zero_retries_degrades_on_first_failure() {
        let job = ScheduledJob::new("scan", "scan", Schedule::every(300), "h").with_retries(0, 30);
        let d = RetryPolicy::for_job(&job).on_failure(&job, secs(0), secs(1)).unwrap();
        assert_eq!(d.status, JobStatus::Degraded);
        assert!(d.newly_degraded);
        assert_eq!(d.next_run_at, secs(301));
    }
}
