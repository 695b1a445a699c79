// src/sources/mod.rs
//! Collaborators the pipeline consumes: where subscriptions come from, where
//! articles are found, and where discovered articles are kept.

pub mod http;
pub mod memory;
pub mod newsapi;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{Article, Subscription};

#[async_trait::async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;
    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait ArticleSource: Send + Sync {
    /// Articles matching `keyword` published strictly after `since`.
    async fn find_articles(&self, keyword: &str, since: DateTime<Utc>) -> Result<Vec<Article>>;
    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait ArticleSink: Send + Sync {
    async fn save(&self, articles: &[Article]) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Drop articles at or before `since`. Undated articles stay: the upstream
/// already matched them against the window and there is nothing to compare.
pub fn retain_newer(articles: Vec<Article>, since: DateTime<Utc>) -> Vec<Article> {
    articles
        .into_iter()
        .filter(|a| a.published_at.map_or(true, |ts| ts > since))
        .collect()
}

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap: 1500 chars
    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap())
    }

    #[test]
    fn normalize_text_strips_markup() {
        let s = "  <p>Bitcoin&nbsp;&nbsp;ETF <b>approved</b></p>\n\n ";
        assert_eq!(normalize_text(s), "Bitcoin ETF approved");
    }

    #[test]
    fn boundary_is_exclusive_and_undated_is_kept() {
        let since = at(5).unwrap();
        let arts = vec![
            Article { title: "before".into(), published_at: at(4), ..Article::default() },
            Article { title: "exact".into(), published_at: at(5), ..Article::default() },
            Article { title: "after".into(), published_at: at(6), ..Article::default() },
            Article { title: "undated".into(), published_at: None, ..Article::default() },
        ];
        let titles: Vec<_> = retain_newer(arts, since).into_iter().map(|a| a.title).collect();
        assert_eq!(titles, vec!["after", "undated"]);
    }
}
