//! Notification dispatch: delivers forwarded action items.
//! Supports: structured log, HTTP webhook, in-memory buffer, and fan-out to several.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::traits::NotificationSink;
use tidewatch_core::types::{ActionItem, Priority};

fn priority_emoji(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "🚨",
        Priority::High => "⚠️",
        Priority::Medium => "📢",
        Priority::Low => "ℹ️",
    }
}

/// Writes each item to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, item: &ActionItem) -> Result<()> {
        tracing::info!(
            key = %item.key,
            priority = %item.priority,
            source = %item.source,
            "{} {}",
            priority_emoji(item.priority),
            item.message
        );
        Ok(())
    }
}

/// Generic HTTP webhook: POST with JSON body.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// JSON body posted for one item.
    pub fn payload(item: &ActionItem) -> serde_json::Value {
        serde_json::json!({
            "key": item.key,
            "priority": item.priority.as_str(),
            "kind": item.kind,
            "message": item.message,
            "source": item.source,
            "affected_entity_ids": item.affected_entity_ids,
            "first_seen_at": item.first_seen_at.map(|t| t.to_rfc3339()),
            "emitted_at": item.last_emitted_at.map(|t| t.to_rfc3339()),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, item: &ActionItem) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&Self::payload(item))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TidewatchError::Collaborator(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, item.key);
            Ok(())
        } else {
            Err(TidewatchError::Collaborator(format!(
                "Webhook error {}",
                resp.status()
            )))
        }
    }
}

/// Keeps delivered items in memory (dashboards, tests).
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    items: Arc<Mutex<Vec<ActionItem>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<ActionItem> {
        self.items
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut items) = self.items.lock() {
            items.clear();
        }
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, item: &ActionItem) -> Result<()> {
        self.items
            .lock()
            .map_err(|_| TidewatchError::Collaborator("memory sink lock poisoned".into()))?
            .push(item.clone());
        Ok(())
    }
}

/// Delivers to every inner sink. One failing target does not stop the rest;
/// the first error is reported after all were attempted.
#[derive(Default, Clone)]
pub struct FanoutSink {
    targets: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.targets.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn deliver(&self, item: &ActionItem) -> Result<()> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(e) = target.deliver(item).await {
                tracing::warn!("⚠️ Sink '{}' failed for {}: {e}", target.name(), item.key);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
