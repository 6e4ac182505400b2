//! Scheduler engine: the loop that claims due jobs and runs them.
//!
//! Each tick lists due jobs, takes a worker slot, then claims the job's
//! lease with a conditional write. A slot counts as processed only once its
//! run completes. Only the claimant runs the handler, under
//! the job's deadline, and writes the outcome back while still holding the
//! lease. Several `Scheduler`s (threads or processes) can share one store.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tidewatch_core::clock::{Clock, checked_secs};
use tidewatch_core::config::SchedulerConfig;
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::types::{ActionItem, CheckResult, CheckStatus, HeartbeatCycleReport};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;

use crate::jobs::{JobRunResult, JobStatus, Schedule, ScheduledJob};
use crate::notify::ActionNotifier;
use crate::pool::{PoolStats, WorkerPool, WorkerSlot};
use crate::registry::{HandlerRegistry, JobContext, JobHandler};
use crate::retry::{RetryPolicy, RunDecision};
use crate::store::{Completion, CycleStore, JobStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Job ids claimed and dispatched by this tick.
    pub claimed: Vec<String>,
    /// Due jobs left for a later tick because every worker slot was busy.
    pub deferred: usize,
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub worker_id: String,
    pub jobs: Vec<ScheduledJob>,
    pub pool: PoolStats,
    pub last_cycle_report: Option<HeartbeatCycleReport>,
}

/// Default worker identity: `{hostname}-{8 hex chars}`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tidewatch".into());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Owns no job state; everything lives in the store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    notifier: Arc<ActionNotifier>,
    clock: Arc<dyn Clock>,
    reports: Option<Arc<dyn CycleStore>>,
    config: SchedulerConfig,
    pool: WorkerPool,
    worker_id: String,
    wake: Arc<Notify>,
    inflight: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        notifier: Arc<ActionNotifier>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_worker_id);
        Self {
            store,
            registry,
            notifier,
            clock,
            reports: None,
            pool: WorkerPool::new(config.worker_concurrency),
            config,
            worker_id,
            wake: Arc::new(Notify::new()),
            inflight: Mutex::new(JoinSet::new()),
        }
    }

    /// Source of `last_cycle_report` in [`Scheduler::status`].
    pub fn with_reports(mut self, reports: Arc<dyn CycleStore>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn notifier(&self) -> Arc<ActionNotifier> {
        Arc::clone(&self.notifier)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Validate and upsert a job definition. A newly created job is due
    /// immediately (interval) or at its first cron match; re-registering an
    /// existing id keeps its run state.
    pub fn register_job(&self, mut job: ScheduledJob) -> Result<ScheduledJob> {
        job.validate()?;
        if !self.registry.contains(&job.handler_ref) {
            return Err(TidewatchError::ScheduleConfig(format!(
                "job '{}' references unknown handler '{}'",
                job.id, job.handler_ref
            )));
        }

        let now = self.clock.now();
        job.next_run_at = match &job.schedule {
            Schedule::Interval { .. } => now,
            Schedule::Cron { .. } => job.schedule.next_due(now)?,
        };

        let stored = self.store.upsert_job(&job)?;
        tracing::info!(
            job_id = %stored.id,
            "📅 Job registered: '{}' ({}), next run {}",
            stored.name,
            stored.schedule,
            stored.next_run_at.to_rfc3339()
        );
        Ok(stored)
    }

    /// Ask for an immediate run. Goes through the normal claim; if the job is
    /// currently leased it runs right after the lease is released.
    pub fn run_now(&self, job_id: &str) -> Result<()> {
        self.store.request_run_now(job_id)?;
        tracing::info!(job_id, "▶️ Run requested");
        self.wake.notify_one();
        Ok(())
    }

    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        self.store.set_enabled(job_id, enabled)?;
        tracing::info!(job_id, enabled, "Job toggled");
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.store.list_jobs()
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        let last_cycle_report = match &self.reports {
            Some(reports) => reports.last_report()?,
            None => None,
        };
        Ok(SchedulerStatus {
            worker_id: self.worker_id.clone(),
            jobs: self.store.list_jobs()?,
            pool: self.pool.stats(),
            last_cycle_report,
        })
    }

    /// One scheduling pass. A store failure while listing or claiming aborts
    /// the pass; nothing is retried until the next tick.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let mut inflight = self.inflight.lock().await;
        while inflight.try_join_next().is_some() {}

        let now = self.clock.now();
        let due = self.store.due_jobs(now)?;
        let mut outcome = TickOutcome::default();

        for (idx, job) in due.iter().enumerate() {
            let Some(handler) = self.registry.get(&job.handler_ref) else {
                tracing::warn!(
                    job_id = %job.id,
                    "⚠️ No handler '{}' in this process, skipping",
                    job.handler_ref
                );
                continue;
            };

            let lease_secs = job.timeout_secs.saturating_add(self.config.lease_grace_secs);
            let Some(lease_until) = checked_secs(lease_secs).and_then(|d| now.checked_add_signed(d))
            else {
                tracing::warn!(
                    job_id = %job.id,
                    "⚠️ Lease of {lease_secs}s is out of range, skipping"
                );
                continue;
            };

            let Some(slot) = self.pool.try_acquire() else {
                outcome.deferred = due.len() - idx;
                tracing::debug!(
                    "⏳ Worker pool full ({}), deferring {} job(s)",
                    self.pool.capacity(),
                    outcome.deferred
                );
                break;
            };

            if !self
                .store
                .try_claim(&job.id, &self.worker_id, now, lease_until)?
            {
                tracing::debug!(job_id = %job.id, "Lease taken by another worker");
                continue;
            }

            tracing::info!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                attempt = job.retry_count + 1,
                "🔔 Job claimed: '{}'",
                job.name
            );
            outcome.claimed.push(job.id.clone());

            let run = ClaimedRun {
                job: job.clone(),
                started_at: now,
                worker_id: self.worker_id.clone(),
                store: Arc::clone(&self.store),
                notifier: Arc::clone(&self.notifier),
                clock: Arc::clone(&self.clock),
                wake: Arc::clone(&self.wake),
            };
            inflight.spawn(run.execute(handler, slot));
        }

        Ok(outcome)
    }

    /// Wait for every dispatched run to finish.
    pub async fn wait_idle(&self) {
        let mut running = std::mem::take(&mut *self.inflight.lock().await);
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Job task aborted: {e}");
            }
        }
    }

    /// Tick until `shutdown` resolves, then drain in-flight runs. Wakes early
    /// on [`Scheduler::run_now`].
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tracing::info!(
            worker_id = %self.worker_id,
            "⏰ Scheduler started (tick every {}s, {} workers)",
            self.config.tick_interval_secs,
            self.pool.capacity()
        );

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.tick_interval_secs.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.tick().await {
                tracing::warn!(reason = e.reason_code(), "⚠️ Tick aborted: {e}");
            }
        }

        tracing::info!("🛑 Scheduler stopping, waiting for in-flight jobs");
        self.wait_idle().await;
    }
}

/// A claimed job travelling to a worker slot.
struct ClaimedRun {
    job: ScheduledJob,
    started_at: DateTime<Utc>,
    worker_id: String,
    store: Arc<dyn JobStore>,
    notifier: Arc<ActionNotifier>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
}

impl ClaimedRun {
    async fn execute(self, handler: Arc<dyn JobHandler>, slot: WorkerSlot) {
        let job = &self.job;
        let ctx = JobContext {
            job_id: job.id.clone(),
            worker_id: self.worker_id.clone(),
            started_at: self.started_at,
            attempt: job.retry_count + 1,
        };

        let outcome = invoke(handler, ctx, job.timeout_secs).await;
        let finished_at = self.clock.now();
        let policy = RetryPolicy::for_job(job);

        let (success, decision, result) = match outcome {
            Ok(mut result) => {
                result.settle();
                if job.status == JobStatus::Degraded {
                    tracing::info!(job_id = %job.id, "💚 Job recovered after {} failure(s)", job.retry_count);
                } else {
                    tracing::info!(job_id = %job.id, status = %result.status, "✅ Job finished");
                }
                let decision = policy.on_success(job, self.started_at, finished_at);
                let run_result = JobRunResult {
                    status: result.status,
                    reason: None,
                    message: result.error_message().map(str::to_string),
                    metrics: result.metrics.clone(),
                };
                if !result.action_items.is_empty() {
                    let items = result
                        .action_items
                        .into_iter()
                        .map(|item| {
                            if item.source.is_empty() {
                                item.with_source(job.id.clone())
                            } else {
                                item
                            }
                        })
                        .collect();
                    self.notifier.publish(items, finished_at).await;
                }
                (true, decision, run_result)
            }
            Err(e) => {
                let reason = match e {
                    TidewatchError::Timeout { .. } => "timeout",
                    _ => "handler_error",
                };
                let decision = policy.on_failure(job, self.started_at, finished_at);
                tracing::warn!(
                    job_id = %job.id,
                    reason,
                    attempt = job.retry_count + 1,
                    "⚠️ Job failed: {e}"
                );
                if let Ok(d) = &decision
                    && d.newly_degraded
                {
                    tracing::error!(job_id = %job.id, retries = d.retry_count, "🚨 Job degraded");
                    let alert = ActionItem::degraded_job(&job.id, d.retry_count, &e.to_string());
                    self.notifier.publish(vec![alert], finished_at).await;
                }
                let run_result = JobRunResult {
                    status: CheckStatus::Error,
                    reason: Some(reason.to_string()),
                    message: Some(e.to_string()),
                    metrics: Default::default(),
                };
                (false, decision, run_result)
            }
        };

        let decision = decision.unwrap_or_else(|e| {
            tracing::error!(job_id = %job.id, "❌ Cannot compute next run: {e}");
            RunDecision {
                retry_count: job.retry_count,
                status: job.status,
                next_run_at: finished_at + Duration::hours(1),
                newly_degraded: false,
            }
        });

        let completion = Completion {
            success,
            finished_at,
            next_run_at: decision.next_run_at,
            retry_count: decision.retry_count,
            status: decision.status,
            result,
        };

        match self.store.complete(&job.id, &self.worker_id, &completion) {
            Ok(true) => {
                tracing::debug!(
                    job_id = %job.id,
                    "Next run {}",
                    completion.next_run_at.to_rfc3339()
                );
            }
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "⚠️ Lease lost before completion, result dropped");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "❌ Failed to record completion: {e}");
            }
        }

        slot.release();

        // A run-now that arrived mid-run is due as soon as the lease is free.
        if let Ok(Some(current)) = self.store.get_job(&job.id)
            && current.run_requested
        {
            self.wake.notify_one();
        }
    }
}

/// Run the handler on its own task under the deadline. Panics count as
/// handler errors; on timeout the task is aborted.
async fn invoke(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    timeout_secs: u64,
) -> Result<CheckResult> {
    let mut task = tokio::spawn(async move { handler.execute(ctx).await });
    let deadline = std::time::Duration::from_secs(timeout_secs.max(1));

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(TidewatchError::Handler(format!(
            "handler panicked: {join_err}"
        ))),
        Err(_) => {
            task.abort();
            Err(TidewatchError::Timeout { secs: timeout_secs })
        }
    }
}
