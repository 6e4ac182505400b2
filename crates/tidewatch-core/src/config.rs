//! Tidewatch configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::clock::MAX_DURATION_SECS;
use crate::error::{Result, TidewatchError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidewatchConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_database_path() -> String { "~/.tidewatch/tidewatch.db".into() }

impl Default for TidewatchConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TidewatchConfig {
    /// Load config from the default path (~/.tidewatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TidewatchError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TidewatchError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TidewatchError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_concurrency == 0 {
            return Err(TidewatchError::Config("scheduler.worker_concurrency must be > 0".into()));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(TidewatchError::Config("scheduler.tick_interval_secs must be > 0".into()));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(TidewatchError::Config("heartbeat.interval_secs must be > 0".into()));
        }
        for check in &self.heartbeat.http_checks {
            if check.name.trim().is_empty() || check.url.trim().is_empty() {
                return Err(TidewatchError::Config(
                    "heartbeat.http_checks entries need a name and url".into(),
                ));
            }
        }
        self.validate_durations()
    }

    /// Every second-valued setting must fit in [`MAX_DURATION_SECS`].
    fn validate_durations(&self) -> Result<()> {
        let s = &self.scheduler;
        let h = &self.heartbeat;
        let days = &self.pipeline.stale_days;
        let mut fields: Vec<(String, u64)> = vec![
            ("scheduler.tick_interval_secs".into(), s.tick_interval_secs),
            ("scheduler.lease_grace_secs".into(), s.lease_grace_secs),
            ("scheduler.default_timeout_secs".into(), s.default_timeout_secs),
            ("scheduler.default_backoff_base_secs".into(), s.default_backoff_base_secs),
            ("heartbeat.interval_secs".into(), h.interval_secs),
            ("heartbeat.cooldown_secs".into(), h.cooldown_secs),
            ("pipeline.override_grace_secs".into(), self.pipeline.override_grace_secs),
        ];
        for (stage, value) in [
            ("new", days.new),
            ("enriched", days.enriched),
            ("researched", days.researched),
            ("waiting_for_contracts", days.waiting_for_contracts),
        ] {
            fields.push((
                format!("pipeline.stale_days.{stage}"),
                u64::from(value).saturating_mul(86_400),
            ));
        }
        for (check, tier) in &h.tiers {
            fields.push((format!("heartbeat.tiers.{check}"), *tier));
        }
        for check in &h.http_checks {
            fields.push((format!("heartbeat.http_checks.{}.timeout_secs", check.name), check.timeout_secs));
            if let Some(tier) = check.tier_seconds {
                fields.push((format!("heartbeat.http_checks.{}.tier_seconds", check.name), tier));
            }
        }

        match fields.into_iter().find(|(_, secs)| *secs > MAX_DURATION_SECS) {
            Some((field, secs)) => Err(TidewatchError::Config(format!(
                "{field} = {secs} exceeds the {MAX_DURATION_SECS}s limit"
            ))),
            None => Ok(()),
        }
    }

    /// Database path with `~` expanded.
    pub fn resolved_database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Tidewatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tidewatch")
    }
}

/// Scheduler loop, worker pool, and retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Added to a job's timeout to form its lease duration.
    #[serde(default = "default_lease_grace")]
    pub lease_grace_secs: u64,
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub default_backoff_base_secs: u64,
    /// Overrides the generated `hostname-uuid` worker id.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_tick_interval() -> u64 { 15 }
fn default_worker_concurrency() -> usize { 4 }
fn default_lease_grace() -> u64 { 30 }
fn default_timeout() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_backoff_base() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            worker_concurrency: default_worker_concurrency(),
            lease_grace_secs: default_lease_grace(),
            default_timeout_secs: default_timeout(),
            default_max_retries: default_max_retries(),
            default_backoff_base_secs: default_backoff_base(),
            worker_id: None,
        }
    }
}

/// Heartbeat orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Minimum seconds between two deliveries of the same action item key.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Check name → tier interval in seconds.
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, u64>,
    /// Number of cycle reports kept in the database.
    #[serde(default = "default_report_history")]
    pub report_history: usize,
    #[serde(default)]
    pub http_checks: Vec<HttpCheckConfig>,
    /// Optional webhook receiving forwarded action items.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_heartbeat_interval() -> u64 { 60 }
fn default_cooldown() -> u64 { 3600 }
fn default_report_history() -> usize { 50 }
fn default_tiers() -> BTreeMap<String, u64> {
    [
        ("portfolio", 300),
        ("market", 3600),
        ("relationship", 86_400),
        ("predictive", 21_600),
        ("system_health", 60),
        ("pipeline", 300),
    ]
    .into_iter()
    .map(|(name, secs)| (name.to_string(), secs))
    .collect()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            cooldown_secs: default_cooldown(),
            tiers: default_tiers(),
            report_history: default_report_history(),
            http_checks: Vec::new(),
            webhook_url: None,
        }
    }
}

impl HeartbeatConfig {
    /// Tier for a named check; unknown checks run every cycle.
    pub fn tier_for(&self, check: &str) -> u64 {
        self.tiers.get(check).copied().unwrap_or(0)
    }
}

/// A collaborator check reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheckConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub tier_seconds: Option<u64>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 { 20 }

/// Pipeline state machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_override_grace")]
    pub override_grace_secs: u64,
    #[serde(default)]
    pub stale_days: StaleDays,
}

fn default_override_grace() -> u64 { 86_400 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            override_grace_secs: default_override_grace(),
            stale_days: StaleDays::default(),
        }
    }
}

/// Per-stage stale thresholds in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleDays {
    #[serde(default = "default_stale_new")]
    pub new: u32,
    #[serde(default = "default_stale_enriched")]
    pub enriched: u32,
    #[serde(default = "default_stale_researched")]
    pub researched: u32,
    #[serde(default = "default_stale_waiting")]
    pub waiting_for_contracts: u32,
}

fn default_stale_new() -> u32 { 3 }
fn default_stale_enriched() -> u32 { 5 }
fn default_stale_researched() -> u32 { 7 }
fn default_stale_waiting() -> u32 { 10 }

impl Default for StaleDays {
    fn default() -> Self {
        Self {
            new: default_stale_new(),
            enriched: default_stale_enriched(),
            researched: default_stale_researched(),
            waiting_for_contracts: default_stale_waiting(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
