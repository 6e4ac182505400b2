//! Per-stage stale thresholds from configuration.

use chrono::Duration;
use tidewatch_core::clock::checked_secs;
use tidewatch_core::config::PipelineConfig;
use tidewatch_core::traits::StaleThreshold;
use tidewatch_core::types::PipelineStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleThresholds {
    pub new: Duration,
    pub enriched: Duration,
    pub researched: Duration,
    pub waiting_for_contracts: Duration,
}

impl StaleThresholds {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let days = &config.stale_days;
        Self {
            new: days_span(days.new),
            enriched: days_span(days.enriched),
            researched: days_span(days.researched),
            waiting_for_contracts: days_span(days.waiting_for_contracts),
        }
    }
}

/// Out-of-range day counts can never be reached, so they disable the stage.
fn days_span(days: u32) -> Duration {
    checked_secs(u64::from(days).saturating_mul(86_400)).unwrap_or_else(Duration::zero)
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl StaleThreshold for StaleThresholds {
    fn threshold(&self, stage: PipelineStage) -> Option<Duration> {
        let limit = match stage {
            PipelineStage::New => self.new,
            PipelineStage::Enriched => self.enriched,
            PipelineStage::Researched => self.researched,
            PipelineStage::WaitingForContracts => self.waiting_for_contracts,
            PipelineStage::Complete => return None,
        };
        // A zero-day threshold disables detection for the stage.
        (limit > Duration::zero()).then_some(limit)
    }
}
