//! Seams between the core and its collaborators.

pub mod check;
pub mod collaborators;
pub mod notify;

pub use check::{Check, CheckContext};
pub use collaborators::{NoopTransitionHook, StageSignal, StaleThreshold, TransitionHook};
pub use notify::NotificationSink;
