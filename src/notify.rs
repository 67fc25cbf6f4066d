//! Outbound delivery of rendered digests.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<()>;
}

/// POSTs `{to, subject, html}` to a mail relay webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("vinyl-watch/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<()> {
        let mut req = self.http.post(&self.url).json(&json!({
            "to": recipient,
            "subject": subject,
            "html": html,
        }));
        if let Some(token) = self.token.as_deref() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| PipelineError::Notify {
            recipient: recipient.to_string(),
            reason: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(PipelineError::Notify {
                recipient: recipient.to_string(),
                reason: format!("webhook answered {status}"),
            }));
        }
        info!(recipient, "digest delivered");
        Ok(())
    }
}

/// Logs digests instead of delivering them. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<()> {
        info!(recipient, subject, bytes = html.len(), "digest ready (no webhook configured)");
        Ok(())
    }
}
