//! # Tidewatch Pipeline
//!
//! Signal-gated entity lifecycle:
//! `NEW → ENRICHED → RESEARCHED → WAITING_FOR_CONTRACTS → COMPLETE`.
//!
//! Entities advance one stage per evaluation pass when the next stage's
//! readiness signal holds, pause after a manual override, and raise stale
//! action items when they dwell too long in a stage.

pub mod db;
pub mod machine;
pub mod signals;
pub mod store;
pub mod thresholds;

pub use db::PipelineDb;
pub use machine::{PIPELINE_CHECK, PassReport, PipelineCheck, Transition};
pub use store::{PipelineStore, TrackedEntityPipelineState};
pub use thresholds::StaleThresholds;
