// src/sources/newsapi.rs
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::histogram;
use serde::Deserialize;
use std::time::Duration;

use crate::model::{parse_published_at, Article};
use crate::sources::{normalize_text, retain_newer, ArticleSource};

pub const DEFAULT_BASE_URL: &str = "https://newsapi.org";
const PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct EverythingResponse {
    status: String,
    #[serde(rename = "totalResults", default)]
    total_results: u64,
    #[serde(default)]
    articles: Vec<RawArticle>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    source: Option<RawSource>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    #[serde(rename = "urlToImage")]
    url_to_image: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

/// Keyword search against a NewsAPI `/v2/everything` endpoint.
pub struct NewsApiSource {
    mode: Mode,
}

enum Mode {
    // Canned response body, served for every keyword.
    Fixture(String),
    Http {
        base_url: String,
        api_key: String,
        client: reqwest::Client,
    },
}

impl NewsApiSource {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_url(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building newsapi http client")?;
        Ok(Self {
            mode: Mode::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
                client,
            },
        })
    }

    /// Decode an `/everything` body and keep articles newer than `since`.
    pub fn parse_everything(body: &str, since: DateTime<Utc>) -> Result<Vec<Article>> {
        let t0 = std::time::Instant::now();
        let resp: EverythingResponse =
            serde_json::from_str(body).context("parsing newsapi response")?;
        if resp.status != "ok" {
            bail!(
                "newsapi status {}: {}",
                resp.status,
                resp.message.unwrap_or_default()
            );
        }
        if resp.total_results == 0 {
            return Ok(Vec::new());
        }

        let articles = resp
            .articles
            .into_iter()
            .map(|raw| Article {
                source: raw.source.and_then(|s| s.name).unwrap_or_default(),
                author: raw.author.unwrap_or_default(),
                title: normalize_text(raw.title.as_deref().unwrap_or_default()),
                description: normalize_text(raw.description.as_deref().unwrap_or_default()),
                url: raw.url.unwrap_or_default(),
                image_url: raw.url_to_image.unwrap_or_default(),
                published_at: raw.published_at.as_deref().and_then(parse_published_at),
            })
            .filter(|a| !a.title.is_empty() || !a.url.is_empty())
            .collect();

        histogram!("scanner_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(retain_newer(articles, since))
    }
}

#[async_trait]
impl ArticleSource for NewsApiSource {
    async fn find_articles(&self, keyword: &str, since: DateTime<Utc>) -> Result<Vec<Article>> {
        match &self.mode {
            Mode::Fixture(body) => Self::parse_everything(body, since),
            Mode::Http {
                base_url,
                api_key,
                client,
            } => {
                let from = since.to_rfc3339_opts(SecondsFormat::Secs, true);
                let page_size = PAGE_SIZE.to_string();
                let resp = client
                    .get(format!("{base_url}/v2/everything"))
                    .query(&[
                        ("q", keyword),
                        ("from", from.as_str()),
                        ("sortBy", "publishedAt"),
                        ("pageSize", page_size.as_str()),
                        ("apiKey", api_key.as_str()),
                    ])
                    .send()
                    .await
                    .context("newsapi http get()")?;
                let status = resp.status();
                let body = resp.text().await.context("newsapi http .text()")?;
                if !status.is_success() {
                    return Err(anyhow!("newsapi returned status {status}"));
                }
                Self::parse_everything(&body, since)
            }
        }
    }

    fn name(&self) -> &'static str {
        "newsapi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn error_status_is_an_error() {
        let body = r#"{"status":"error","code":"apiKeyInvalid","message":"bad key"}"#;
        let err = NewsApiSource::parse_everything(body, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn zero_results_is_empty_success() {
        let body = r#"{"status":"ok","totalResults":0,"articles":[]}"#;
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(NewsApiSource::parse_everything(body, since).unwrap().is_empty());
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(NewsApiSource::parse_everything("<html>", Utc::now()).is_err());
    }
}
