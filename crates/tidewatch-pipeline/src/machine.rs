//! Pipeline state machine, run as a heartbeat check.
//!
//! Per active, non-terminal entity and per pass:
//! 1. inside the manual-override grace window → no advancement;
//! 2. otherwise ask the signal for the *next* stage and, if it holds, advance
//!    exactly one step (version-checked) and notify the transition hook;
//! 3. an entity that did not advance is checked against its stage's stale
//!    threshold and may yield a `stale:{entity}:{STAGE}` action item.
//!
//! Collaborator failures are isolated per entity.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tidewatch_core::error::Result;
use tidewatch_core::traits::{
    Check, CheckContext, NoopTransitionHook, StageSignal, StaleThreshold, TransitionHook,
};
use tidewatch_core::types::{ActionItem, ActionKind, CheckResult, PipelineStage, Priority};

use crate::store::{PipelineStore, TrackedEntityPipelineState};

/// Name the check registers under.
pub const PIPELINE_CHECK: &str = "pipeline";

/// One automatic stage change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub entity_id: String,
    pub from: PipelineStage,
    pub to: PipelineStage,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub evaluated: usize,
    pub advanced: Vec<Transition>,
    pub in_grace: usize,
    pub errors: usize,
    pub action_items: Vec<ActionItem>,
}

pub struct PipelineCheck {
    store: Arc<dyn PipelineStore>,
    signals: Arc<dyn StageSignal>,
    thresholds: Arc<dyn StaleThreshold>,
    hook: Arc<dyn TransitionHook>,
}

impl PipelineCheck {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        signals: Arc<dyn StageSignal>,
        thresholds: Arc<dyn StaleThreshold>,
    ) -> Self {
        Self {
            store,
            signals,
            thresholds,
            hook: Arc::new(NoopTransitionHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// One pass over every active entity.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();

        for state in self.store.list_active()? {
            if state.stage.is_terminal() {
                continue;
            }
            report.evaluated += 1;

            let advanced = if state.in_override_grace(now) {
                report.in_grace += 1;
                tracing::debug!(entity_id = %state.entity_id, "⏸️ In manual-override grace");
                false
            } else {
                match self.try_advance(&state, now).await {
                    Ok(Some(transition)) => {
                        report.advanced.push(transition);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!(
                            entity_id = %state.entity_id,
                            reason = e.reason_code(),
                            "⚠️ Skipping advancement: {e}"
                        );
                        false
                    }
                }
            };

            if !advanced && let Some(item) = self.stale_item(&state, now) {
                report.action_items.push(item);
            }
        }

        if !report.advanced.is_empty() || !report.action_items.is_empty() {
            tracing::info!(
                "🔄 Pipeline pass: {} evaluated, {} advanced, {} stale",
                report.evaluated,
                report.advanced.len(),
                report.action_items.len()
            );
        }
        Ok(report)
    }

    async fn try_advance(
        &self,
        state: &TrackedEntityPipelineState,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        let Some(next) = state.stage.next() else {
            return Ok(None);
        };
        if !self.signals.holds(next, &state.entity_id).await? {
            return Ok(None);
        }
        if !self
            .store
            .advance(&state.entity_id, state.stage, next, state.version, now)?
        {
            tracing::debug!(entity_id = %state.entity_id, "Entity changed during pass, not advancing");
            return Ok(None);
        }

        tracing::info!(
            entity_id = %state.entity_id,
            "➡️ {} → {}",
            state.stage,
            next
        );
        if let Err(e) = self
            .hook
            .on_transition(&state.entity_id, state.stage, next)
            .await
        {
            tracing::warn!(
                entity_id = %state.entity_id,
                "⚠️ Transition hook failed (stage change kept): {e}"
            );
        }

        Ok(Some(Transition {
            entity_id: state.entity_id.clone(),
            from: state.stage,
            to: next,
        }))
    }

    fn stale_item(&self, state: &TrackedEntityPipelineState, now: DateTime<Utc>) -> Option<ActionItem> {
        let threshold = self.thresholds.threshold(state.stage)?;
        let dwell = state.dwell(now);
        if dwell <= threshold {
            return None;
        }

        let overage = dwell - threshold;
        let priority = if overage > threshold * 2 {
            Priority::High
        } else {
            Priority::Medium
        };

        Some(
            ActionItem::new(
                priority,
                format!("stale:{}:{}", state.entity_id, state.stage),
                format!(
                    "Entity {} has been in {} for {} (threshold {})",
                    state.entity_id,
                    state.stage,
                    human_days(dwell),
                    human_days(threshold)
                ),
            )
            .with_kind(ActionKind::Stale)
            .with_entities([state.entity_id.clone()])
            .with_source(PIPELINE_CHECK),
        )
    }
}

fn human_days(d: Duration) -> String {
    let hours = d.num_hours();
    if hours >= 48 {
        format!("{} days", hours / 24)
    } else {
        format!("{hours}h")
    }
}

#[async_trait]
impl Check for PipelineCheck {
    fn name(&self) -> &str {
        PIPELINE_CHECK
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let report = self.evaluate(ctx.now).await?;
        let mut result = CheckResult::from_items(report.action_items)
            .with_metric("evaluated", report.evaluated)
            .with_metric("advanced", report.advanced.len())
            .with_metric("in_grace", report.in_grace)
            .with_metric("entity_errors", report.errors);
        result.settle();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PipelineDb;
    use crate::thresholds::StaleThresholds;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tidewatch_core::error::TidewatchError;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    struct AllSignals;

    #[async_trait]
    impl StageSignal for AllSignals {
        async fn holds(&self, _: PipelineStage, _: &str) -> Result<bool> {
            Ok(true)
        }
    }

    /// Fails for one entity, holds for every other.
    struct FlakySignals(&'static str);

    #[async_trait]
    impl StageSignal for FlakySignals {
        async fn holds(&self, _: PipelineStage, entity_id: &str) -> Result<bool> {
            if entity_id == self.0 {
                Err(TidewatchError::Collaborator("enrichment API down".into()))
            } else {
                Ok(true)
            }
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, PipelineStage, PipelineStage)>>,
        fail: bool,
    }

    #[async_trait]
    impl TransitionHook for RecordingHook {
        async fn on_transition(
            &self,
            entity_id: &str,
            from: PipelineStage,
            to: PipelineStage,
        ) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((entity_id.to_string(), from, to));
            if self.fail {
                Err(TidewatchError::Collaborator("summary service down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn check_with(db: &Arc<PipelineDb>, signals: Arc<dyn StageSignal>) -> PipelineCheck {
        PipelineCheck::new(db.clone(), signals, Arc::new(StaleThresholds::default()))
    }

    #[tokio::test]
    async fn test_advances_one_stage_per_pass() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        db.track("5", t0()).unwrap();
        let check = check_with(&db, Arc::new(AllSignals));

        let expected = [
            PipelineStage::Enriched,
            PipelineStage::Researched,
            PipelineStage::WaitingForContracts,
            PipelineStage::Complete,
        ];
        for (pass, stage) in expected.into_iter().enumerate() {
            let now = t0() + Duration::minutes(pass as i64 + 1);
            let report = check.evaluate(now).await.unwrap();
            assert_eq!(report.advanced.len(), 1);
            let state = db.get("5").unwrap().unwrap();
            assert_eq!(state.stage, stage);
            assert_eq!(state.stage_changed_at, now);
        }

        // Terminal: nothing left to evaluate.
        let report = check.evaluate(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.evaluated, 0);
    }

    #[tokio::test]
    async fn test_signal_table_drives_first_step() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        db.track("5", t0()).unwrap();
        let check = check_with(&db, db.clone());

        assert!(check.evaluate(t0()).await.unwrap().advanced.is_empty());

        db.record_signal("5", PipelineStage::Enriched, t0()).unwrap();
        let now = t0() + Duration::minutes(5);
        let report = check.evaluate(now).await.unwrap();
        assert_eq!(
            report.advanced,
            vec![Transition {
                entity_id: "5".into(),
                from: PipelineStage::New,
                to: PipelineStage::Enriched
            }]
        );
        let state = db.get("5").unwrap().unwrap();
        assert_eq!(state.stage, PipelineStage::Enriched);
        assert_eq!(state.stage_changed_at, now);
    }

    #[tokio::test]
    async fn test_manual_override_grace_window() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap().with_override_grace(86_400));
        db.set_manual_stage("5", PipelineStage::New, t0()).unwrap();
        let check = check_with(&db, Arc::new(AllSignals));

        let report = check.evaluate(t0() + Duration::hours(23)).await.unwrap();
        assert!(report.advanced.is_empty());
        assert_eq!(report.in_grace, 1);
        assert_eq!(db.get("5").unwrap().unwrap().stage, PipelineStage::New);

        let report = check.evaluate(t0() + Duration::hours(24)).await.unwrap();
        assert_eq!(report.advanced.len(), 1);
        assert_eq!(db.get("5").unwrap().unwrap().stage, PipelineStage::Enriched);
    }

    #[tokio::test]
    async fn test_stale_detection_runs_during_grace() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap().with_override_grace(30 * 86_400));
        db.set_manual_stage("5", PipelineStage::Researched, t0()).unwrap();
        let check = check_with(&db, Arc::new(AllSignals));

        let report = check.evaluate(t0() + Duration::days(8)).await.unwrap();
        assert!(report.advanced.is_empty());
        assert_eq!(report.action_items.len(), 1);
        assert_eq!(report.action_items[0].key, "stale:5:RESEARCHED");
    }

    #[tokio::test]
    async fn test_stale_priority_escalates() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        db.track("5", t0()).unwrap();
        db.advance("5", PipelineStage::New, PipelineStage::Enriched, 0, t0())
            .unwrap();
        db.advance("5", PipelineStage::Enriched, PipelineStage::Researched, 1, t0())
            .unwrap();
        db.advance(
            "5",
            PipelineStage::Researched,
            PipelineStage::WaitingForContracts,
            2,
            t0(),
        )
        .unwrap();
        let check = check_with(&db, db.clone());

        // 8 days against a 10-day threshold: fine.
        assert!(check.evaluate(t0() + Duration::days(8)).await.unwrap().action_items.is_empty());

        // 12 days: 2 over, medium.
        let items = check.evaluate(t0() + Duration::days(12)).await.unwrap().action_items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "stale:5:WAITING_FOR_CONTRACTS");
        assert_eq!(items[0].priority, Priority::Medium);
        assert_eq!(items[0].kind, ActionKind::Stale);
        assert_eq!(items[0].affected_entity_ids, vec!["5".to_string()]);

        // 31 days: 21 over (> 2 × 10), high.
        let items = check.evaluate(t0() + Duration::days(31)).await.unwrap().action_items;
        assert_eq!(items[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_hook_failure_keeps_stage_change() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        db.track("5", t0()).unwrap();
        let hook = Arc::new(RecordingHook {
            fail: true,
            ..Default::default()
        });
        let check = check_with(&db, Arc::new(AllSignals)).with_hook(hook.clone());

        let report = check.evaluate(t0()).await.unwrap();
        assert_eq!(report.advanced.len(), 1);
        assert_eq!(report.errors, 0);
        assert_eq!(db.get("5").unwrap().unwrap().stage, PipelineStage::Enriched);
        assert_eq!(
            hook.calls.lock().unwrap().as_slice(),
            &[("5".to_string(), PipelineStage::New, PipelineStage::Enriched)]
        );
    }

    #[tokio::test]
    async fn test_signal_errors_are_isolated_per_entity() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        for id in ["1", "2", "3"] {
            db.track(id, t0()).unwrap();
        }
        let check = check_with(&db, Arc::new(FlakySignals("2")));

        // Old enough that the failing entity is also stale.
        let report = check.evaluate(t0() + Duration::days(4)).await.unwrap();
        assert_eq!(report.errors, 1);
        let moved: HashSet<_> = report.advanced.iter().map(|t| t.entity_id.as_str()).collect();
        assert_eq!(moved, HashSet::from(["1", "3"]));
        assert_eq!(report.action_items.len(), 1);
        assert_eq!(report.action_items[0].key, "stale:2:NEW");
    }

    #[tokio::test]
    async fn test_check_result_shape() {
        let db = Arc::new(PipelineDb::open_in_memory().unwrap());
        db.track("5", t0()).unwrap();
        let check = check_with(&db, db.clone());
        let ctx = CheckContext {
            cycle_id: "c1".into(),
            now: t0() + Duration::days(4),
        };
        let result = check.run(&ctx).await.unwrap();
        assert_eq!(result.status, tidewatch_core::types::CheckStatus::ActionNeeded);
        assert_eq!(result.metrics["evaluated"], 1);
        assert_eq!(result.action_items[0].source, PIPELINE_CHECK);
    }
}
