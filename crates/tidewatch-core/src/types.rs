//! Shared data types: action items, check results, pipeline stages, cycle reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::TidewatchError;

// ─── Action items ──────────────────────────────────────

/// Action item priority. Ordered so that `Urgent` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = TidewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(TidewatchError::Config(format!("unknown priority '{other}'"))),
        }
    }
}

/// What produced an action item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Attention,
    Stale,
    SystemAlert,
}

/// A deduplicated, priority-tagged unit of attention-worthy output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub priority: Priority,
    pub kind: ActionKind,
    /// Stable dedup key, e.g. `stale:{entity_id}:{stage}`.
    pub key: String,
    pub message: String,
    #[serde(default)]
    pub affected_entity_ids: Vec<String>,
    /// Name of the check or job that raised the item.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_emitted_at: Option<DateTime<Utc>>,
}

impl ActionItem {
    pub fn new(priority: Priority, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            priority,
            kind: ActionKind::Attention,
            key: key.into(),
            message: message.into(),
            affected_entity_ids: Vec::new(),
            source: String::new(),
            first_seen_at: None,
            last_emitted_at: None,
        }
    }

    /// Alert raised when a job crosses its retry ceiling.
    pub fn degraded_job(job_id: &str, retry_count: u32, reason: &str) -> Self {
        let mut item = Self::new(
            Priority::High,
            format!("degraded:{job_id}"),
            format!("Job '{job_id}' degraded after {retry_count} consecutive failures: {reason}"),
        );
        item.kind = ActionKind::SystemAlert;
        item.source = "scheduler".into();
        item
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_entities<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_entity_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Fold another item with the same key into this one. The higher
    /// priority wins the message; affected entities are unioned.
    pub fn absorb(&mut self, other: ActionItem) {
        if other.priority > self.priority {
            self.priority = other.priority;
            self.message = other.message;
            self.kind = other.kind;
            self.source = other.source;
        }
        for id in other.affected_entity_ids {
            if !self.affected_entity_ids.contains(&id) {
                self.affected_entity_ids.push(id);
            }
        }
    }
}

// ─── Check results ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    ActionNeeded,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::ActionNeeded => "action_needed",
            CheckStatus::Error => "error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a check or job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

impl CheckResult {
    pub fn ok() -> Self {
        Self {
            status: CheckStatus::Ok,
            action_items: Vec::new(),
            metrics: serde_json::Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut result = Self::ok();
        result.status = CheckStatus::Error;
        result
            .metrics
            .insert("error".into(), serde_json::Value::String(message.into()));
        result
    }

    /// Build a result from items; status is `action_needed` when any exist.
    pub fn from_items(items: Vec<ActionItem>) -> Self {
        let mut result = Self::ok();
        result.action_items = items;
        result.settle();
        result
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    /// Promote `ok` to `action_needed` if items were attached afterwards.
    pub fn settle(&mut self) {
        if self.status == CheckStatus::Ok && !self.action_items.is_empty() {
            self.status = CheckStatus::ActionNeeded;
        }
    }

    /// Error message recorded by [`CheckResult::error`], if any.
    pub fn error_message(&self) -> Option<&str> {
        self.metrics.get("error").and_then(|v| v.as_str())
    }
}

// ─── Pipeline stages ──────────────────────────────────────

/// Ordered entity lifecycle. `Complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    New,
    Enriched,
    Researched,
    WaitingForContracts,
    Complete,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::New,
        PipelineStage::Enriched,
        PipelineStage::Researched,
        PipelineStage::WaitingForContracts,
        PipelineStage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::New => "NEW",
            PipelineStage::Enriched => "ENRICHED",
            PipelineStage::Researched => "RESEARCHED",
            PipelineStage::WaitingForContracts => "WAITING_FOR_CONTRACTS",
            PipelineStage::Complete => "COMPLETE",
        }
    }

    /// The stage immediately following this one, `None` for `Complete`.
    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::New => Some(PipelineStage::Enriched),
            PipelineStage::Enriched => Some(PipelineStage::Researched),
            PipelineStage::Researched => Some(PipelineStage::WaitingForContracts),
            PipelineStage::WaitingForContracts => Some(PipelineStage::Complete),
            PipelineStage::Complete => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Complete)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = TidewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| TidewatchError::Config(format!("unknown pipeline stage '{s}'")))
    }
}

// ─── Cycle reports ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

impl From<CheckStatus> for HealthStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Ok => HealthStatus::Ok,
            CheckStatus::ActionNeeded => HealthStatus::Degraded,
            CheckStatus::Error => HealthStatus::Error,
        }
    }
}

/// Per-check line in a cycle report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: CheckStatus,
    pub action_items: usize,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything one heartbeat invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatCycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checks_executed: u32,
    pub checks_failed: u32,
    #[serde(default)]
    pub checks: Vec<CheckOutcome>,
    /// Deduplicated across all checks run in this cycle.
    pub action_items: Vec<ActionItem>,
    /// How many of `action_items` were forwarded to the sink this cycle.
    #[serde(default)]
    pub forwarded: usize,
    pub system_health: BTreeMap<String, HealthStatus>,
}
