//! # Tidewatch Scheduler
//!
//! Persistent job scheduler with lease-based exclusive execution.
//!
//! ## Design Principles
//! - SQLite is the only coordination point, no leader election
//! - A job runs only after a conditional lease claim succeeds
//! - Bounded worker pool; a full pool defers work to the next tick
//! - Retries with exponential backoff, then `degraded` on the normal cadence
//! - Action items dedupe by key with a per-key emission cooldown
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval + run-now wake)
//!   ├── JobStore.due_jobs(now)
//!   ├── WorkerPool.try_acquire()   → none free: defer
//!   ├── JobStore.try_claim()       → lost race: skip
//!   └── worker: handler under timeout
//!         ├── ok   → next_run = next_due(schedule)
//!         └── err  → RetryPolicy → backoff | degraded alert
//!                     └── ActionNotifier → ledger cooldown → NotificationSink
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod jobs;
pub mod notify;
pub mod persistence;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod store;

pub use dispatch::{FanoutSink, LogSink, MemorySink, WebhookSink};
pub use engine::{Scheduler, SchedulerStatus, TickOutcome};
pub use jobs::{JobRunResult, JobStatus, Schedule, ScheduledJob};
pub use notify::{ActionNotifier, PublishOutcome};
pub use persistence::SchedulerDb;
pub use pool::{PoolStats, WorkerPool};
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use retry::RetryPolicy;
pub use store::{ActionLedger, CycleStore, JobStore};
