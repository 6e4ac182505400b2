//! Heartbeat orchestrator: one scheduled job that runs the registered
//! checks in registration order, each on its own tier, and folds their
//! output into a single [`HeartbeatCycleReport`].
//!
//! ## Cycle
//! - a check is eligible when it never ran or `now - last_run_at >= tier`
//! - eligible checks run sequentially; a failing or panicking check becomes
//!   an `error` result and the cycle continues
//! - action items are merged by key, then pass the notifier's cooldown
//! - the report is persisted and becomes `last_cycle_report` in status

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tidewatch_core::clock::{Clock, checked_secs};
use tidewatch_core::config::HeartbeatConfig;
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::traits::{Check, CheckContext};
use tidewatch_core::types::{
    ActionItem, CheckOutcome, CheckResult, CheckStatus, HealthStatus, HeartbeatCycleReport,
};
use tidewatch_scheduler::jobs::{Schedule, ScheduledJob};
use tidewatch_scheduler::notify::ActionNotifier;
use tidewatch_scheduler::registry::{JobContext, JobHandler};
use tidewatch_scheduler::store::CycleStore;
use tokio::task::JoinSet;

/// Job id and handler ref of the heartbeat job.
pub const HEARTBEAT_JOB: &str = "heartbeat";

/// A check as registered with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    pub tier_seconds: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl CheckDefinition {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => {
                checked_secs(self.tier_seconds).is_some_and(|tier| now - last >= tier)
            }
        }
    }
}

#[derive(Clone)]
struct RegisteredCheck {
    name: String,
    tier_seconds: u64,
    check: Arc<dyn Check>,
}

pub struct HeartbeatOrchestrator {
    checks: RwLock<Vec<RegisteredCheck>>,
    cycles: Arc<dyn CycleStore>,
    notifier: Arc<ActionNotifier>,
    clock: Arc<dyn Clock>,
    report_history: usize,
}

impl HeartbeatOrchestrator {
    pub fn new(
        cycles: Arc<dyn CycleStore>,
        notifier: Arc<ActionNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            cycles,
            notifier,
            clock,
            report_history: 50,
        }
    }

    pub fn with_report_history(mut self, keep: usize) -> Self {
        self.report_history = keep.max(1);
        self
    }

    /// The scheduled job driving this orchestrator.
    pub fn job(config: &HeartbeatConfig) -> ScheduledJob {
        ScheduledJob::new(
            HEARTBEAT_JOB,
            "Heartbeat",
            Schedule::every(config.interval_secs.max(1)),
            HEARTBEAT_JOB,
        )
    }

    /// Register (or re-register) a check. Checks run in registration order;
    /// re-registering a name keeps its position and persisted `last_run_at`.
    pub fn register_check(&self, check: Arc<dyn Check>, tier_seconds: u64) -> Result<CheckDefinition> {
        let name = check.name().to_string();
        if name.trim().is_empty() {
            return Err(TidewatchError::ScheduleConfig("check name must not be empty".into()));
        }
        if checked_secs(tier_seconds).is_none() {
            return Err(TidewatchError::ScheduleConfig(format!(
                "check '{name}': tier {tier_seconds}s is out of range"
            )));
        }
        let last_run_at = self.cycles.upsert_check(&name, tier_seconds)?;

        let mut checks = self
            .checks
            .write()
            .map_err(|_| TidewatchError::Handler("check registry lock poisoned".into()))?;
        let entry = RegisteredCheck {
            name: name.clone(),
            tier_seconds,
            check,
        };
        match checks.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = entry,
            None => checks.push(entry),
        }
        tracing::info!("🩺 Check registered: {name} (tier {tier_seconds}s)");

        Ok(CheckDefinition {
            name,
            tier_seconds,
            last_run_at,
        })
    }

    /// Registered checks with their persisted last run.
    pub fn checks(&self) -> Result<Vec<CheckDefinition>> {
        self.snapshot()?
            .into_iter()
            .map(|c| {
                Ok(CheckDefinition {
                    last_run_at: self.cycles.upsert_check(&c.name, c.tier_seconds)?,
                    name: c.name,
                    tier_seconds: c.tier_seconds,
                })
            })
            .collect()
    }

    fn snapshot(&self) -> Result<Vec<RegisteredCheck>> {
        self.checks
            .read()
            .map(|c| c.clone())
            .map_err(|_| TidewatchError::Handler("check registry lock poisoned".into()))
    }

    /// Run one cycle.
    pub async fn run_cycle(&self) -> Result<HeartbeatCycleReport> {
        let cycle_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now();

        let mut outcomes = Vec::new();
        let mut items: Vec<ActionItem> = Vec::new();
        let mut health = BTreeMap::new();
        let mut failed = 0u32;

        for registered in self.snapshot()? {
            let now = self.clock.now();
            let result = match self
                .cycles
                .upsert_check(&registered.name, registered.tier_seconds)
            {
                Ok(last_run_at) => {
                    let definition = CheckDefinition {
                        name: registered.name.clone(),
                        tier_seconds: registered.tier_seconds,
                        last_run_at,
                    };
                    if !definition.is_eligible(now) {
                        continue;
                    }
                    let ctx = CheckContext {
                        cycle_id: cycle_id.clone(),
                        now,
                    };
                    let result = run_isolated(Arc::clone(&registered.check), ctx).await;
                    if let Err(e) = self.cycles.record_check_run(&registered.name, now) {
                        tracing::warn!(check = %registered.name, "⚠️ Failed to record check run: {e}");
                    }
                    result
                }
                // Eligibility is unknown; report the check as failed and carry on.
                Err(e) => CheckResult::error(format!("check state unavailable: {e}")),
            };

            let error = result.error_message().map(str::to_string);
            if result.status == CheckStatus::Error {
                failed += 1;
                tracing::warn!(
                    check = %registered.name,
                    "⚠️ Check failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                );
            } else {
                tracing::debug!(check = %registered.name, status = %result.status, "Check finished");
            }

            health.insert(registered.name.clone(), HealthStatus::from(result.status));
            merge_components(&mut health, &result);

            outcomes.push(CheckOutcome {
                name: registered.name.clone(),
                status: result.status,
                action_items: result.action_items.len(),
                error,
            });
            items.extend(result.action_items.into_iter().map(|item| {
                if item.source.is_empty() {
                    item.with_source(registered.name.clone())
                } else {
                    item
                }
            }));
        }

        let published = self.notifier.publish(items, self.clock.now()).await;

        let report = HeartbeatCycleReport {
            cycle_id,
            started_at,
            finished_at: self.clock.now(),
            checks_executed: outcomes.len() as u32,
            checks_failed: failed,
            checks: outcomes,
            action_items: published.items,
            forwarded: published.forwarded,
            system_health: health,
        };

        if let Err(e) = self.cycles.save_report(&report, self.report_history) {
            tracing::warn!("⚠️ Failed to save cycle report: {e}");
        }

        tracing::info!(
            cycle_id = %report.cycle_id,
            "💓 Heartbeat: {} check(s), {} failed, {} item(s), {} forwarded",
            report.checks_executed,
            report.checks_failed,
            report.action_items.len(),
            report.forwarded
        );
        Ok(report)
    }
}

/// Run a check on its own task so both `Err` and panics become `error` results.
/// The task lives in a local `JoinSet`, so dropping the cycle (for example on
/// the heartbeat job's deadline) aborts the check with it.
async fn run_isolated(check: Arc<dyn Check>, ctx: CheckContext) -> CheckResult {
    let mut task = JoinSet::new();
    task.spawn(async move { check.run(&ctx).await });
    match task.join_next().await {
        Some(Ok(Ok(mut result))) => {
            result.settle();
            result
        }
        Some(Ok(Err(e))) => CheckResult::error(e.to_string()),
        Some(Err(join_err)) => CheckResult::error(format!("check panicked: {join_err}")),
        None => CheckResult::error("check task vanished"),
    }
}

/// Fold a check's `components` metric (`{name: "ok"|"degraded"|"error"}`)
/// into the cycle's health map.
fn merge_components(health: &mut BTreeMap<String, HealthStatus>, result: &CheckResult) {
    let Some(components) = result.metrics.get("components").and_then(|v| v.as_object()) else {
        return;
    };
    for (component, status) in components {
        if let Ok(status) = serde_json::from_value::<HealthStatus>(status.clone()) {
            health.insert(component.clone(), status);
        }
    }
}

#[async_trait]
impl JobHandler for HeartbeatOrchestrator {
    async fn execute(&self, _ctx: JobContext) -> Result<CheckResult> {
        let report = self.run_cycle().await?;
        let mut result = CheckResult::ok()
            .with_metric("cycle_id", report.cycle_id.clone())
            .with_metric("checks_executed", report.checks_executed)
            .with_metric("checks_failed", report.checks_failed)
            .with_metric("action_items", report.action_items.len())
            .with_metric("forwarded", report.forwarded);
        if !report.action_items.is_empty() || report.checks_failed > 0 {
            result.status = CheckStatus::ActionNeeded;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tidewatch_core::clock::ManualClock;
    use tidewatch_core::types::Priority;
    use tidewatch_scheduler::dispatch::MemorySink;
    use tidewatch_scheduler::persistence::SchedulerDb;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    struct Counting {
        name: &'static str,
        runs: AtomicU32,
        items: Vec<ActionItem>,
    }

    impl Counting {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                runs: AtomicU32::new(0),
                items: Vec::new(),
            }
        }

        fn with_item(mut self, item: ActionItem) -> Self {
            self.items.push(item);
            self
        }
    }

    #[async_trait]
    impl Check for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult::from_items(self.items.clone()))
        }
    }

    struct Failing;

    #[async_trait]
    impl Check for Failing {
        fn name(&self) -> &str {
            "market"
        }

        async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
            Err(TidewatchError::Collaborator("quote feed unreachable".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Check for Panicking {
        fn name(&self) -> &str {
            "predictive"
        }

        async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
            panic!("model file missing")
        }
    }

    struct Fixture {
        db: Arc<SchedulerDb>,
        clock: ManualClock,
        sink: MemorySink,
        heartbeat: HeartbeatOrchestrator,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let clock = ManualClock::new(t0());
        let sink = MemorySink::new();
        let notifier = Arc::new(ActionNotifier::new(
            db.clone(),
            Arc::new(sink.clone()),
            Duration::seconds(3600),
        ));
        let heartbeat = HeartbeatOrchestrator::new(db.clone(), notifier, Arc::new(clock.clone()));
        Fixture {
            db,
            clock,
            sink,
            heartbeat,
        }
    }

    #[tokio::test]
    async fn test_checks_run_on_their_tiers() {
        let f = fixture();
        let fast = Arc::new(Counting::new("system_health"));
        let slow = Arc::new(Counting::new("relationship"));
        f.heartbeat.register_check(fast.clone(), 60).unwrap();
        f.heartbeat.register_check(slow.clone(), 86_400).unwrap();

        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.checks_executed, 2);

        f.clock.advance(Duration::seconds(60));
        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.checks_executed, 1);
        assert_eq!(report.checks[0].name, "system_health");

        f.clock.advance(Duration::days(1));
        f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(fast.runs.load(Ordering::SeqCst), 3);
        assert_eq!(slow.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let f = fixture();
        let first = Arc::new(Counting::new("portfolio"));
        let last = Arc::new(Counting::new("system_health"));
        f.heartbeat.register_check(first.clone(), 0).unwrap();
        f.heartbeat.register_check(Arc::new(Failing), 0).unwrap();
        f.heartbeat.register_check(Arc::new(Panicking), 0).unwrap();
        f.heartbeat.register_check(last.clone(), 0).unwrap();

        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.checks_executed, 4);
        assert_eq!(report.checks_failed, 2);
        let names: Vec<_> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["portfolio", "market", "predictive", "system_health"]);
        assert!(report.checks[1].error.as_deref().unwrap().contains("quote feed"));
        assert!(report.checks[2].error.as_deref().unwrap().contains("panicked"));
        assert_eq!(report.system_health["market"], HealthStatus::Error);
        assert_eq!(report.system_health["portfolio"], HealthStatus::Ok);
        assert_eq!(last.runs.load(Ordering::SeqCst), 1);
    }

    /// Delegates to the real store but fails check bookkeeping once broken.
    struct FlakyCycles {
        inner: Arc<SchedulerDb>,
        broken: std::sync::atomic::AtomicBool,
    }

    impl FlakyCycles {
        fn fail(&self, what: &str) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(TidewatchError::Persistence(format!("{what}: disk I/O error")));
            }
            Ok(())
        }
    }

    impl CycleStore for FlakyCycles {
        fn upsert_check(&self, name: &str, tier_seconds: u64) -> Result<Option<DateTime<Utc>>> {
            if name == "market" {
                self.fail("upsert_check")?;
            }
            self.inner.upsert_check(name, tier_seconds)
        }
        fn record_check_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
            if name == "portfolio" {
                self.fail("record_check_run")?;
            }
            self.inner.record_check_run(name, at)
        }
        fn save_report(&self, report: &HeartbeatCycleReport, keep: usize) -> Result<()> {
            self.inner.save_report(report, keep)
        }
        fn last_report(&self) -> Result<Option<HeartbeatCycleReport>> {
            self.inner.last_report()
        }
        fn recent_reports(&self, limit: usize) -> Result<Vec<HeartbeatCycleReport>> {
            self.inner.recent_reports(limit)
        }
    }

    #[tokio::test]
    async fn test_check_bookkeeping_errors_do_not_abort_cycle() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let cycles = Arc::new(FlakyCycles {
            inner: db.clone(),
            broken: std::sync::atomic::AtomicBool::new(false),
        });
        let sink = MemorySink::new();
        let notifier = Arc::new(ActionNotifier::new(
            db.clone(),
            Arc::new(sink.clone()),
            Duration::seconds(3600),
        ));
        let heartbeat =
            HeartbeatOrchestrator::new(cycles.clone(), notifier, Arc::new(ManualClock::new(t0())));

        let portfolio = Arc::new(Counting::new("portfolio").with_item(ActionItem::new(
            Priority::High,
            "attention:owner-call",
            "Owner asked for a call back",
        )));
        let market = Arc::new(Counting::new("market"));
        heartbeat.register_check(portfolio.clone(), 0).unwrap();
        heartbeat.register_check(market.clone(), 0).unwrap();
        cycles.broken.store(true, Ordering::SeqCst);

        let report = heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.checks_executed, 2);
        assert_eq!(report.checks_failed, 1);
        assert_eq!(report.system_health["portfolio"], HealthStatus::Degraded);
        assert_eq!(report.system_health["market"], HealthStatus::Error);
        assert!(report.checks[1].error.as_deref().unwrap().contains("disk I/O"));
        assert_eq!(market.runs.load(Ordering::SeqCst), 0);
        assert_eq!(portfolio.runs.load(Ordering::SeqCst), 1);

        // The portfolio item survives the failed run bookkeeping.
        assert_eq!(report.action_items.len(), 1);
        assert_eq!(report.forwarded, 1);
        assert_eq!(sink.delivered()[0].key, "attention:owner-call");
        assert_eq!(db.last_report().unwrap().unwrap().cycle_id, report.cycle_id);
    }

    #[tokio::test]
    async fn test_items_merged_across_checks_and_cooled_down() {
        let f = fixture();
        let shared = |p, msg: &str, who: &str| {
            ActionItem::new(p, "attention:owner-call", msg).with_entities([who.to_string()])
        };
        f.heartbeat
            .register_check(
                Arc::new(Counting::new("portfolio").with_item(shared(Priority::Low, "low", "7"))),
                0,
            )
            .unwrap();
        f.heartbeat
            .register_check(
                Arc::new(
                    Counting::new("relationship").with_item(shared(Priority::High, "high", "8")),
                ),
                0,
            )
            .unwrap();

        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.action_items.len(), 1);
        assert_eq!(report.action_items[0].priority, Priority::High);
        assert_eq!(report.action_items[0].source, "relationship");
        assert_eq!(report.action_items[0].affected_entity_ids, vec!["7", "8"]);
        assert_eq!(report.forwarded, 1);

        f.clock.advance(Duration::minutes(10));
        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.action_items.len(), 1);
        assert_eq!(report.forwarded, 0);
        assert_eq!(f.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_components_feed_system_health() {
        struct Components;

        #[async_trait]
        impl Check for Components {
            fn name(&self) -> &str {
                "system_health"
            }

            async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
                Ok(CheckResult::ok().with_metric(
                    "components",
                    serde_json::json!({"database": "ok", "scheduler": "degraded"}),
                ))
            }
        }

        let f = fixture();
        f.heartbeat.register_check(Arc::new(Components), 60).unwrap();
        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(report.system_health["database"], HealthStatus::Ok);
        assert_eq!(report.system_health["scheduler"], HealthStatus::Degraded);
        assert_eq!(report.system_health["system_health"], HealthStatus::Ok);
    }

    #[tokio::test]
    async fn test_reports_persist_and_tier_state_survives_restart() {
        let f = fixture();
        f.heartbeat
            .register_check(Arc::new(Counting::new("market")), 3600)
            .unwrap();
        let report = f.heartbeat.run_cycle().await.unwrap();
        assert_eq!(
            f.db.last_report().unwrap().unwrap().cycle_id,
            report.cycle_id
        );

        // A fresh orchestrator over the same store sees the persisted last run.
        let notifier = Arc::new(ActionNotifier::new(
            f.db.clone(),
            Arc::new(MemorySink::new()),
            Duration::seconds(3600),
        ));
        let restarted =
            HeartbeatOrchestrator::new(f.db.clone(), notifier, Arc::new(f.clock.clone()));
        let def = restarted
            .register_check(Arc::new(Counting::new("market")), 3600)
            .unwrap();
        assert_eq!(def.last_run_at, Some(t0()));
        assert_eq!(restarted.run_cycle().await.unwrap().checks_executed, 0);
    }

    #[tokio::test]
    async fn test_job_handler_summary() {
        let f = fixture();
        f.heartbeat.register_check(Arc::new(Failing), 0).unwrap();
        let result = f
            .heartbeat
            .execute(JobContext {
                job_id: HEARTBEAT_JOB.into(),
                worker_id: "w".into(),
                started_at: t0(),
                attempt: 1,
            })
            .await
            .unwrap();
        assert_eq!(result.status, CheckStatus::ActionNeeded);
        assert_eq!(result.metrics["checks_failed"], 1);
        assert!(result.action_items.is_empty());
    }
}
