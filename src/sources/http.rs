// src/sources/http.rs
//! JSON-over-HTTP adapters for the subscription directory and article sink.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{Article, Subscription};
use crate::sources::{ArticleSink, SubscriptionDirectory};

// --- tolerant shapes of the directory response ---

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubscriptionsAny {
    Bare(Vec<Subscription>),
    Wrapped { subscriptions: Vec<Subscription> },
}

pub fn parse_subscriptions(body: &str) -> Result<Vec<Subscription>> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let any: SubscriptionsAny = serde_json::from_str(trimmed)
        .with_context(|| format!("parse subscriptions JSON failed, body: {trimmed}"))?;
    Ok(match any {
        SubscriptionsAny::Bare(v) => v,
        SubscriptionsAny::Wrapped { subscriptions } => subscriptions,
    })
}

fn client_with_timeout(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building http client")
}

#[derive(Clone)]
pub struct HttpDirectory {
    url: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            client: client_with_timeout(timeout)?,
        })
    }
}

#[async_trait]
impl SubscriptionDirectory for HttpDirectory {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("fetch subscriptions")?;
        let status = resp.status();
        let body = resp.text().await.context("read subscriptions body")?;
        if !status.is_success() {
            return Err(anyhow!("subscription directory returned status {status}"));
        }
        parse_subscriptions(&body)
    }

    fn name(&self) -> &'static str {
        "http-directory"
    }
}

#[derive(Serialize)]
struct SaveNewsRequest<'a> {
    news: &'a [Article],
}

#[derive(Clone)]
pub struct HttpArticleSink {
    url: String,
    client: reqwest::Client,
}

impl HttpArticleSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            client: client_with_timeout(timeout)?,
        })
    }
}

#[async_trait]
impl ArticleSink for HttpArticleSink {
    async fn save(&self, articles: &[Article]) -> Result<()> {
        if articles.is_empty() {
            return Ok(());
        }
        let rsp = self
            .client
            .post(&self.url)
            .json(&SaveNewsRequest { news: articles })
            .send()
            .await
            .context("post articles")?;
        rsp.error_for_status_ref()
            .map_err(|e| anyhow!("article sink HTTP error: {e}"))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http-sink"
    }
}
