//! System health check: inspects the scheduler's own job table.

use async_trait::async_trait;
use std::sync::Arc;
use tidewatch_core::error::Result;
use tidewatch_core::traits::{Check, CheckContext};
use tidewatch_core::types::{ActionItem, ActionKind, CheckResult, Priority};
use tidewatch_scheduler::jobs::JobStatus;
use tidewatch_scheduler::store::JobStore;

pub const SYSTEM_HEALTH_CHECK: &str = "system_health";

pub struct SystemHealthCheck {
    jobs: Arc<dyn JobStore>,
}

impl SystemHealthCheck {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Check for SystemHealthCheck {
    fn name(&self) -> &str {
        SYSTEM_HEALTH_CHECK
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let jobs = match self.jobs.list_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                return Ok(CheckResult::error(e.to_string()).with_metric(
                    "components",
                    serde_json::json!({ "database": "error", "scheduler": "error" }),
                ));
            }
        };

        let mut items = Vec::new();
        let mut degraded = 0usize;
        let mut abandoned = 0usize;

        for job in &jobs {
            // The scheduler alerts once when a job degrades; here it only
            // shows up in the metrics and component health.
            if job.status == JobStatus::Degraded {
                degraded += 1;
            }
            // Lease expired without completion: the worker died mid-run.
            if job.leased_until.is_some_and(|until| until < ctx.now) {
                abandoned += 1;
                items.push(
                    ActionItem::new(
                        Priority::Medium,
                        format!("lease:{}", job.id),
                        format!("Job '{}' lease expired without completion", job.id),
                    )
                    .with_kind(ActionKind::SystemAlert)
                    .with_source(SYSTEM_HEALTH_CHECK),
                );
            }
        }

        let scheduler = if degraded > 0 || abandoned > 0 {
            "degraded"
        } else {
            "ok"
        };
        Ok(CheckResult::from_items(items)
            .with_metric("jobs", jobs.len())
            .with_metric("degraded_jobs", degraded)
            .with_metric("abandoned_leases", abandoned)
            .with_metric(
                "components",
                serde_json::json!({ "database": "ok", "scheduler": scheduler }),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tidewatch_core::types::CheckStatus;
    use tidewatch_scheduler::jobs::{Schedule, ScheduledJob};
    use tidewatch_scheduler::persistence::SchedulerDb;
    use tidewatch_scheduler::store::Completion;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn ctx(now: DateTime<Utc>) -> CheckContext {
        CheckContext {
            cycle_id: "c".into(),
            now,
        }
    }

    #[tokio::test]
    async fn test_healthy_jobs() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let mut job = ScheduledJob::new("scan", "Scan", Schedule::every(60), "h");
        job.next_run_at = t0();
        db.upsert_job(&job).unwrap();

        let result = SystemHealthCheck::new(db).run(&ctx(t0())).await.unwrap();
        assert_eq!(result.status, CheckStatus::Ok);
        assert_eq!(result.metrics["components"]["scheduler"], "ok");
    }

    #[tokio::test]
    async fn test_abandoned_leases_raise_items_degraded_jobs_counted() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        for id in ["sync", "crashy"] {
            let mut job = ScheduledJob::new(id, id, Schedule::every(60), "h");
            job.next_run_at = t0();
            db.upsert_job(&job).unwrap();
        }

        db.try_claim("sync", "w1", t0(), t0() + Duration::seconds(90))
            .unwrap();
        db.complete(
            "sync",
            "w1",
            &Completion {
                success: false,
                finished_at: t0(),
                next_run_at: t0() + Duration::seconds(60),
                retry_count: 3,
                status: JobStatus::Degraded,
                result: tidewatch_scheduler::jobs::JobRunResult {
                    status: CheckStatus::Error,
                    reason: Some("handler_error".into()),
                    message: Some("upstream 500".into()),
                    metrics: Default::default(),
                },
            },
        )
        .unwrap();
        db.try_claim("crashy", "w2", t0(), t0() + Duration::seconds(90))
            .unwrap();

        let check = SystemHealthCheck::new(db.clone());
        let result = check.run(&ctx(t0() + Duration::minutes(5))).await.unwrap();
        assert_eq!(result.status, CheckStatus::ActionNeeded);
        let keys: Vec<_> = result.action_items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, ["lease:crashy"]);
        assert_eq!(result.metrics["degraded_jobs"], 1);
        assert_eq!(result.metrics["components"]["scheduler"], "degraded");

        // A degraded job whose retry worker dies is still reported as abandoned.
        let retry_at = t0() + Duration::minutes(6);
        assert!(
            db.try_claim("sync", "w3", retry_at, retry_at + Duration::seconds(90))
                .unwrap()
        );
        let result = check.run(&ctx(t0() + Duration::minutes(10))).await.unwrap();
        let keys: Vec<_> = result.action_items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, ["lease:crashy", "lease:sync"]);
        assert_eq!(result.metrics["degraded_jobs"], 1);
        assert_eq!(result.metrics["abandoned_leases"], 2);
    }
}
