//! # Tidewatch
//!
//! Runs the scheduling core as a daemon and exposes its operator surface.
//!
//! Usage:
//!   tidewatch run                         # Scheduler loop with the heartbeat job
//!   tidewatch heartbeat                   # One heartbeat cycle, print the report
//!   tidewatch jobs                        # List scheduled jobs
//!   tidewatch run-now heartbeat           # Request an immediate run
//!   tidewatch set-stage 5 researched      # Manual pipeline override
//!   tidewatch signal 5 enriched           # Record a readiness signal

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tidewatch_core::clock::{Clock, SystemClock, checked_secs};
use tidewatch_core::config::TidewatchConfig;
use tidewatch_core::traits::NotificationSink;
use tidewatch_core::types::PipelineStage;
use tidewatch_heartbeat::{HEARTBEAT_JOB, HeartbeatOrchestrator, HttpCheck, SystemHealthCheck};
use tidewatch_pipeline::{PIPELINE_CHECK, PipelineCheck, PipelineDb, PipelineStore, StaleThresholds};
use tidewatch_scheduler::registry::HandlerRegistry;
use tidewatch_scheduler::{
    ActionNotifier, FanoutSink, LogSink, Scheduler, SchedulerDb, WebhookSink,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tidewatch",
    version,
    about = "🌊 Tidewatch: leased jobs, heartbeat checks and a signal-driven entity pipeline"
)]
struct Cli {
    /// Config file (default: ~/.tidewatch/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Run a single heartbeat cycle and print its report
    Heartbeat,
    /// List scheduled jobs
    Jobs,
    /// Scheduler status with the last cycle report
    Status,
    /// Request an immediate run of a job
    RunNow { job_id: String },
    /// Enable a job
    Enable { job_id: String },
    /// Disable a job
    Disable { job_id: String },
    /// Start tracking an entity at NEW
    Track { entity_id: String },
    /// Stop tracking an entity
    Untrack { entity_id: String },
    /// Manually set an entity's stage (pauses auto-advance for the grace window)
    SetStage { entity_id: String, stage: String },
    /// Record that an entity is ready for a stage
    Signal { entity_id: String, stage: String },
    /// List active pipeline entities
    Pipeline,
    /// Write the default config file
    Init,
}

/// Everything a command may need, opened from one config.
struct App {
    config: TidewatchConfig,
    scheduler: Scheduler,
    heartbeat: Arc<HeartbeatOrchestrator>,
    pipeline: Arc<PipelineDb>,
    clock: Arc<dyn Clock>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TidewatchConfig::load_from(path)?,
        None => TidewatchConfig::load()?,
    };
    init_logging(&config, cli.verbose);

    if let Command::Init = cli.command {
        config.save()?;
        println!("✅ Config written to {}", TidewatchConfig::default_path().display());
        return Ok(());
    }

    let app = App::open(config)?;

    match cli.command {
        Command::Run => {
            app.register_heartbeat()?;
            app.scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("❌ Ctrl-C handler failed: {e}");
                    }
                })
                .await;
        }
        Command::Heartbeat => {
            let report = app.heartbeat.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Jobs => {
            let jobs = app.scheduler.list_jobs()?;
            if jobs.is_empty() {
                println!("No jobs registered. Start `tidewatch run` once to register the heartbeat.");
            }
            for job in jobs {
                println!(
                    "{:<20} {:<10} {:<18} next {}  retries {}{}",
                    job.id,
                    job.status.as_str(),
                    job.schedule.to_string(),
                    job.next_run_at.to_rfc3339(),
                    job.retry_count,
                    if job.enabled { "" } else { "  (disabled)" }
                );
            }
        }
        Command::Status => {
            let status = app.scheduler.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::RunNow { job_id } => {
            app.scheduler.run_now(&job_id)?;
            println!("▶️  Run requested for '{job_id}'");
        }
        Command::Enable { job_id } => {
            app.scheduler.set_enabled(&job_id, true)?;
            println!("✅ '{job_id}' enabled");
        }
        Command::Disable { job_id } => {
            app.scheduler.set_enabled(&job_id, false)?;
            println!("⏸️  '{job_id}' disabled");
        }
        Command::Track { entity_id } => {
            let state = app.pipeline.track(&entity_id, app.clock.now())?;
            println!("📌 {} tracked at {}", state.entity_id, state.stage);
        }
        Command::Untrack { entity_id } => {
            app.pipeline.untrack(&entity_id)?;
            println!("🗑️  {entity_id} untracked");
        }
        Command::SetStage { entity_id, stage } => {
            let stage: PipelineStage = stage.parse()?;
            let state = app
                .pipeline
                .set_manual_stage(&entity_id, stage, app.clock.now())?;
            println!(
                "✋ {} set to {} (auto-advance paused for {}h)",
                state.entity_id,
                state.stage,
                state.override_grace_secs / 3600
            );
        }
        Command::Signal { entity_id, stage } => {
            let stage: PipelineStage = stage.parse()?;
            app.pipeline
                .record_signal(&entity_id, stage, app.clock.now())?;
            println!("📥 {entity_id} ready for {stage}");
        }
        Command::Pipeline => {
            let now = app.clock.now();
            for state in app.pipeline.list_active()? {
                println!(
                    "{:<16} {:<22} {:>4}d{}",
                    state.entity_id,
                    state.stage.as_str(),
                    state.dwell(now).num_days(),
                    if state.in_override_grace(now) { "  (manual)" } else { "" }
                );
            }
        }
        Command::Init => {}
    }

    Ok(())
}

fn init_logging(config: &TidewatchConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tidewatch={level},tidewatch_scheduler={level},tidewatch_heartbeat={level},tidewatch_pipeline={level}"
        ))
    });
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

impl App {
    fn open(config: TidewatchConfig) -> Result<Self> {
        let db_path = config.resolved_database_path();
        let sched_db = Arc::new(
            SchedulerDb::open(&db_path)
                .with_context(|| format!("opening scheduler db at {}", db_path.display()))?,
        );
        let pipeline = Arc::new(
            PipelineDb::open(&db_path)
                .with_context(|| format!("opening pipeline db at {}", db_path.display()))?
                .with_override_grace(config.pipeline.override_grace_secs),
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut sinks = FanoutSink::new().with(Arc::new(LogSink));
        if let Some(url) = config.heartbeat.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            sinks = sinks.with(Arc::new(WebhookSink::new(url)));
        }
        let sink: Arc<dyn NotificationSink> = Arc::new(sinks);
        let cooldown = checked_secs(config.heartbeat.cooldown_secs)
            .context("heartbeat.cooldown_secs is out of range")?;
        let notifier = Arc::new(ActionNotifier::new(sched_db.clone(), sink, cooldown));

        let heartbeat = Arc::new(
            HeartbeatOrchestrator::new(sched_db.clone(), notifier.clone(), clock.clone())
                .with_report_history(config.heartbeat.report_history),
        );
        let tiers = &config.heartbeat;
        heartbeat.register_check(
            Arc::new(SystemHealthCheck::new(sched_db.clone())),
            tiers.tier_for(tidewatch_heartbeat::checks::SYSTEM_HEALTH_CHECK),
        )?;
        heartbeat.register_check(
            Arc::new(PipelineCheck::new(
                pipeline.clone(),
                pipeline.clone(),
                Arc::new(StaleThresholds::from_config(&config.pipeline)),
            )),
            tiers.tier_for(PIPELINE_CHECK),
        )?;
        for http in &tiers.http_checks {
            let tier = http.tier_seconds.unwrap_or_else(|| tiers.tier_for(&http.name));
            heartbeat.register_check(Arc::new(HttpCheck::from_config(http)), tier)?;
        }

        let registry = HandlerRegistry::new().with(HEARTBEAT_JOB, heartbeat.clone());
        let scheduler = Scheduler::new(
            sched_db.clone(),
            registry,
            notifier,
            clock.clone(),
            config.scheduler.clone(),
        )
        .with_reports(sched_db);

        Ok(Self {
            config,
            scheduler,
            heartbeat,
            pipeline,
            clock,
        })
    }

    fn register_heartbeat(&self) -> Result<()> {
        let job = HeartbeatOrchestrator::job(&self.config.heartbeat)
            .with_defaults(&self.config.scheduler);
        self.scheduler.register_job(job)?;
        Ok(())
    }
}
