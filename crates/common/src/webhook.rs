//! Alert webhook transport.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::model::WebhookPayload;

#[async_trait]
pub trait Webhook: Send + Sync {
    async fn post(&self, payload: &WebhookPayload) -> Result<()>;
}

pub struct HttpWebhook {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }
        info!(url = %self.url, status = %response.status(), "alert posted to webhook");
        Ok(())
    }
}

/// Dev webhook: logs the payload and drops it.
pub struct NoopWebhook;

#[async_trait]
impl Webhook for NoopWebhook {
    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        info!(
            source = %payload.source,
            label = %payload.label,
            confidence = payload.confidence,
            "alert payload (no webhook configured)"
        );
        Ok(())
    }
}
