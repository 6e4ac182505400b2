//! HTTP collaborator check: lets an external collaborator (portfolio, market,
//! relationship, predictive services) act as a check by serving a
//! `CheckResult` JSON document.

use async_trait::async_trait;
use tidewatch_core::config::HttpCheckConfig;
use tidewatch_core::error::{Result, TidewatchError};
use tidewatch_core::traits::{Check, CheckContext};
use tidewatch_core::types::CheckResult;

pub struct HttpCheck {
    name: String,
    url: String,
    timeout: std::time::Duration,
    client: reqwest::Client,
}

impl HttpCheck {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout: std::time::Duration::from_secs(timeout_secs.max(1)),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &HttpCheckConfig) -> Self {
        Self::new(&config.name, &config.url, config.timeout_secs)
    }

    /// Parse a collaborator response body. Items without a source are
    /// attributed to this check.
    pub fn parse_body(&self, body: &str) -> Result<CheckResult> {
        let mut result: CheckResult = serde_json::from_str(body).map_err(|e| {
            TidewatchError::Collaborator(format!("{}: invalid check document: {e}", self.name))
        })?;
        for item in &mut result.action_items {
            if item.source.is_empty() {
                item.source = self.name.clone();
            }
        }
        result.settle();
        Ok(result)
    }
}

#[async_trait]
impl Check for HttpCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext) -> Result<CheckResult> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("cycle_id", ctx.cycle_id.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TidewatchError::Collaborator(format!("{}: request failed: {e}", self.name)))?;

        if !resp.status().is_success() {
            return Err(TidewatchError::Collaborator(format!(
                "{}: HTTP {}",
                self.name,
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TidewatchError::Collaborator(format!("{}: read failed: {e}", self.name)))?;
        self.parse_body(&body)
    }
}
