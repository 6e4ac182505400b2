//! Action item notifier: dedupes by key, enforces the emission cooldown
//! through the ledger, and forwards survivors to the sink.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tidewatch_core::traits::NotificationSink;
use tidewatch_core::types::ActionItem;

use crate::store::ActionLedger;

/// In-memory history of forwarded items (ring buffer, max 100).
const HISTORY_LIMIT: usize = 100;

/// Result of publishing one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOutcome {
    /// Every item in the batch (merged by key), annotated with ledger timestamps.
    pub items: Vec<ActionItem>,
    /// Items handed to the sink this time (outside cooldown).
    pub forwarded: usize,
}

/// Merge items sharing a key. First occurrence keeps its position.
pub fn merge_by_key(items: impl IntoIterator<Item = ActionItem>) -> Vec<ActionItem> {
    let mut merged: Vec<ActionItem> = Vec::new();
    for item in items {
        match merged.iter_mut().find(|m| m.key == item.key) {
            Some(existing) => existing.absorb(item),
            None => merged.push(item),
        }
    }
    merged
}

pub struct ActionNotifier {
    ledger: Arc<dyn ActionLedger>,
    sink: Arc<dyn NotificationSink>,
    cooldown: Duration,
    history: Mutex<VecDeque<ActionItem>>,
}

impl ActionNotifier {
    pub fn new(
        ledger: Arc<dyn ActionLedger>,
        sink: Arc<dyn NotificationSink>,
        cooldown: Duration,
    ) -> Self {
        Self {
            ledger,
            sink,
            cooldown,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Publish a batch. An item is forwarded only if this caller wins the
    /// emission claim for its key; concurrent publishers never both forward.
    pub async fn publish(&self, items: Vec<ActionItem>, now: DateTime<Utc>) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        for mut item in merge_by_key(items) {
            match self.ledger.observe(&item, now) {
                Ok(entry) => {
                    item.first_seen_at = Some(entry.first_seen_at);
                    item.last_emitted_at = entry.last_emitted_at;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Action ledger unavailable for {}: {e}", item.key);
                    outcome.items.push(item);
                    continue;
                }
            }

            let claimed = match self.ledger.try_claim_emission(&item.key, now, self.cooldown) {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::warn!("⚠️ Emission claim failed for {}: {e}", item.key);
                    false
                }
            };

            if claimed {
                item.last_emitted_at = Some(now);
                if let Err(e) = self.sink.deliver(&item).await {
                    tracing::warn!(
                        "⚠️ Sink '{}' failed to deliver {}: {e}",
                        self.sink.name(),
                        item.key
                    );
                }
                self.record(item.clone());
                outcome.forwarded += 1;
            } else {
                tracing::debug!("🔕 {} suppressed by cooldown", item.key);
            }
            outcome.items.push(item);
        }

        outcome
    }

    fn record(&self, item: ActionItem) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(item);
            // Ring buffer, keep last 100
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Forwarded items, oldest first.
    pub fn history(&self) -> Vec<ActionItem> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}
