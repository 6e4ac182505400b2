//! Scheduler → heartbeat → pipeline on one SQLite file.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tidewatch_core::clock::{Clock, ManualClock};
use tidewatch_core::config::{HeartbeatConfig, PipelineConfig, SchedulerConfig};
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::traits::{Check, CheckContext};
use tidewatch_core::types::{ActionKind, CheckResult, CheckStatus, HealthStatus, PipelineStage};
use tidewatch_heartbeat::{HEARTBEAT_JOB, HeartbeatOrchestrator, SystemHealthCheck};
use tidewatch_pipeline::{PipelineCheck, PipelineDb, PipelineStore, StaleThresholds};
use tidewatch_scheduler::dispatch::MemorySink;
use tidewatch_scheduler::engine::Scheduler;
use tidewatch_scheduler::notify::ActionNotifier;
use tidewatch_scheduler::persistence::SchedulerDb;
use tidewatch_scheduler::registry::HandlerRegistry;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

struct HourlyMarket {
    runs: AtomicU32,
}

#[async_trait]
impl Check for HourlyMarket {
    fn name(&self) -> &str {
        "market"
    }

    async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::ok().with_metric("listings_scanned", 12))
    }
}

struct Offline;

#[async_trait]
impl Check for Offline {
    fn name(&self) -> &str {
        "relationship"
    }

    async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
        Err(TidewatchError::Collaborator("relationship service unavailable".into()))
    }
}

#[tokio::test]
async fn test_heartbeat_cycle_through_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidewatch.db");
    let clock = Arc::new(ManualClock::new(t0()));

    let sched_db = Arc::new(SchedulerDb::open(&path).unwrap());
    let pipeline_db = Arc::new(PipelineDb::open(&path).unwrap());

    // Entity 5 was moved by hand eight days ago; its grace window is long gone.
    pipeline_db
        .set_manual_stage("5", PipelineStage::WaitingForContracts, t0() - Duration::days(8))
        .unwrap();
    // Entity 6 is new and its enrichment record has arrived.
    pipeline_db.track("6", t0()).unwrap();
    pipeline_db
        .record_signal("6", PipelineStage::Enriched, t0())
        .unwrap();

    let sink = Arc::new(MemorySink::new());
    let notifier = Arc::new(ActionNotifier::new(
        sched_db.clone(),
        sink.clone(),
        Duration::hours(1),
    ));

    let mut pipeline_config = PipelineConfig::default();
    pipeline_config.stale_days.waiting_for_contracts = 7;
    let pipeline = PipelineCheck::new(
        pipeline_db.clone(),
        pipeline_db.clone(),
        Arc::new(StaleThresholds::from_config(&pipeline_config)),
    );

    let heartbeat = Arc::new(HeartbeatOrchestrator::new(
        sched_db.clone(),
        notifier.clone(),
        clock.clone(),
    ));
    let market = Arc::new(HourlyMarket {
        runs: AtomicU32::new(0),
    });
    heartbeat
        .register_check(Arc::new(SystemHealthCheck::new(sched_db.clone())), 60)
        .unwrap();
    heartbeat.register_check(Arc::new(pipeline), 60).unwrap();
    heartbeat.register_check(market.clone(), 3600).unwrap();
    heartbeat.register_check(Arc::new(Offline), 0).unwrap();

    let scheduler = Scheduler::new(
        sched_db.clone(),
        HandlerRegistry::new().with(HEARTBEAT_JOB, heartbeat.clone()),
        notifier.clone(),
        clock.clone(),
        SchedulerConfig::default(),
    )
    .with_reports(sched_db.clone());
    scheduler
        .register_job(HeartbeatOrchestrator::job(&HeartbeatConfig::default()))
        .unwrap();

    // ── Cycle 1 ──
    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.claimed, vec![HEARTBEAT_JOB.to_string()]);
    scheduler.wait_idle().await;

    let report = scheduler
        .status()
        .unwrap()
        .last_cycle_report
        .expect("cycle report persisted");
    assert_eq!(report.checks_executed, 4);
    assert_eq!(report.checks_failed, 1);
    assert_eq!(report.forwarded, 1);
    assert_eq!(report.system_health["relationship"], HealthStatus::Error);
    assert_eq!(report.system_health["database"], HealthStatus::Ok);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].key, "stale:5:WAITING_FOR_CONTRACTS");
    assert_eq!(delivered[0].kind, ActionKind::Stale);
    assert_eq!(delivered[0].affected_entity_ids, vec!["5".to_string()]);

    let six = pipeline_db.get("6").unwrap().unwrap();
    assert_eq!(six.stage, PipelineStage::Enriched);

    let job = sched_db_job(&scheduler);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.next_run_at, clock.now() + Duration::seconds(60));
    assert_eq!(
        job.last_result.as_ref().map(|r| r.status),
        Some(CheckStatus::ActionNeeded)
    );

    // ── Cycle 2, one minute later ──
    clock.advance(Duration::seconds(60));
    let tick = scheduler.tick().await.unwrap();
    assert_eq!(tick.claimed.len(), 1);
    scheduler.wait_idle().await;

    let second = scheduler.status().unwrap().last_cycle_report.unwrap();
    assert_ne!(second.cycle_id, report.cycle_id);
    // The hourly market check is not eligible yet.
    assert_eq!(second.checks_executed, 3);
    assert_eq!(market.runs.load(Ordering::SeqCst), 1);
    // Still stale, but inside the cooldown.
    assert!(
        second
            .action_items
            .iter()
            .any(|i| i.key == "stale:5:WAITING_FOR_CONTRACTS")
    );
    assert_eq!(second.forwarded, 0);
    assert_eq!(sink.delivered().len(), 1);
}

fn sched_db_job(scheduler: &Scheduler) -> tidewatch_scheduler::jobs::ScheduledJob {
    scheduler
        .list_jobs()
        .unwrap()
        .into_iter()
        .find(|j| j.id == HEARTBEAT_JOB)
        .unwrap()
}

#[tokio::test]
async fn test_pipeline_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidewatch.db");

    {
        let db = PipelineDb::open(&path).unwrap();
        db.track("9", t0()).unwrap();
        db.set_manual_stage("9", PipelineStage::Researched, t0())
            .unwrap();
    }

    let db = PipelineDb::open(&path).unwrap();
    let state = db.get("9").unwrap().unwrap();
    assert_eq!(state.stage, PipelineStage::Researched);
    assert!(state.in_override_grace(t0() + Duration::hours(1)));
    assert!(!state.in_override_grace(t0() + Duration::hours(25)));
}

/// Sleeps past the heartbeat deadline, then records that it finished.
struct Straggler {
    finished: Arc<AtomicU32>,
}

#[async_trait]
impl Check for Straggler {
    fn name(&self) -> &str {
        "portfolio"
    }

    async fn run(&self, _: &CheckContext) -> Result<CheckResult> {
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult::ok())
    }
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_cycle_stops_its_checks() {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let notifier = Arc::new(ActionNotifier::new(
        db.clone(),
        Arc::new(MemorySink::new()),
        Duration::hours(1),
    ));
    let heartbeat = Arc::new(HeartbeatOrchestrator::new(
        db.clone(),
        notifier.clone(),
        clock.clone(),
    ));
    let finished = Arc::new(AtomicU32::new(0));
    heartbeat
        .register_check(
            Arc::new(Straggler {
                finished: finished.clone(),
            }),
            0,
        )
        .unwrap();

    let scheduler = Scheduler::new(
        db.clone(),
        HandlerRegistry::new().with(HEARTBEAT_JOB, heartbeat),
        notifier,
        clock.clone(),
        SchedulerConfig::default(),
    );
    scheduler
        .register_job(HeartbeatOrchestrator::job(&HeartbeatConfig::default()).with_timeout(5))
        .unwrap();

    scheduler.tick().await.unwrap();
    scheduler.wait_idle().await;
    let job = sched_db_job(&scheduler);
    assert_eq!(
        job.last_result.and_then(|r| r.reason).as_deref(),
        Some("timeout")
    );

    tokio::time::sleep(std::time::Duration::from_secs(200)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}
