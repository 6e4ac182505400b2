//! # Tidewatch Core
//!
//! Shared vocabulary for the scheduling core: error taxonomy, configuration,
//! the clock abstraction, data types, and the collaborator traits the
//! scheduler, heartbeat and pipeline crates plug into.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TidewatchConfig;
pub use error::{Result, TidewatchError};
pub use types::{
    ActionItem, ActionKind, CheckOutcome, CheckResult, CheckStatus, HealthStatus,
    HeartbeatCycleReport, PipelineStage, Priority,
};
