//! Notification sink: where forwarded action items go.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ActionItem;

/// Fire-and-forget delivery. Errors are logged by the caller, not retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, item: &ActionItem) -> Result<()>;
}
