//! # Tidewatch Heartbeat
//!
//! A single scheduled job that runs tiered checks sequentially and merges
//! their output into one deduplicated cycle report.
//!
//! ```text
//! heartbeat job (every 60s)
//!   ├── system_health   tier 60s
//!   ├── pipeline        tier 300s
//!   ├── portfolio       tier 300s     (HttpCheck)
//!   ├── market          tier 3600s    (HttpCheck)
//!   └── …
//!   → merge items by key → cooldown → NotificationSink
//!   → HeartbeatCycleReport (persisted)
//! ```

pub mod checks;
pub mod orchestrator;

pub use checks::{HttpCheck, SystemHealthCheck};
pub use orchestrator::{CheckDefinition, HEARTBEAT_JOB, HeartbeatOrchestrator};
