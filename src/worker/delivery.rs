// src/worker/delivery.rs
//! Delivery side effects. The worker calls exactly one `Deliverer` per
//! envelope and treats `Ok` as "the user has been notified". Retries and their
//! backoff belong to the worker, so a deliverer makes a single attempt.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::model::{NotificationEnvelope, UserId};

#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, user_id: UserId, envelope: &NotificationEnvelope) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Stub side effect: one structured log line per notification.
#[derive(Debug, Clone, Default)]
pub struct LogDeliverer;

#[async_trait]
impl Deliverer for LogDeliverer {
    async fn deliver(&self, user_id: UserId, env: &NotificationEnvelope) -> Result<()> {
        let published = env
            .article
            .published_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            target: "delivery",
            event_id = %env.event_id,
            user_id,
            topic = %env.keyword,
            title = %env.article.title,
            author = %env.article.author,
            published = %published,
            url = %env.article.url,
            enqueued = %env.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            "notification sent"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event_id: &'a str,
    user_id: UserId,
    keyword: &'a str,
    title: &'a str,
    description: &'a str,
    url: &'a str,
    source: &'a str,
    published_at: Option<String>,
}

/// POSTs each notification as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookDeliverer {
    webhook: String,
    client: Client,
    timeout: Duration,
}

impl WebhookDeliverer {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Per-request timeout. Keep it at or below the worker's delivery
    /// timeout, which bounds the whole call.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, user_id: UserId, env: &NotificationEnvelope) -> Result<()> {
        let payload = WebhookPayload {
            event_id: &env.event_id,
            user_id,
            keyword: &env.keyword,
            title: &env.article.title,
            description: &env.article.description,
            url: &env.article.url,
            source: &env.article.source,
            published_at: env.article.published_at.map(|ts| ts.to_rfc3339()),
        };

        let rsp = self
            .client
            .post(&self.webhook)
            .timeout(self.timeout)
            .header("Idempotency-Key", env.event_id.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("webhook request failed: {e}"))?;
        rsp.error_for_status_ref()
            .map_err(|e| anyhow!("webhook HTTP error: {e}"))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
