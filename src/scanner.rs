// src/scanner.rs
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};

use crate::error::{within, PipelineError};
use crate::model::Article;
use crate::sources::{ArticleSink, ArticleSource};

/// Finds the articles of one keyword newer than a bound and hands them to the
/// sink. The sink is a side channel: its failures never fail a scan.
pub struct Scanner {
    source: Arc<dyn ArticleSource>,
    sink: Option<Arc<dyn ArticleSink>>,
    timeout: Duration,
}

impl Scanner {
    pub fn new(source: Arc<dyn ArticleSource>, timeout: Duration) -> Self {
        Self {
            source,
            sink: None,
            timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArticleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn scan(
        &self,
        keyword: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Article>, PipelineError> {
        let t0 = Instant::now();
        let res = within(
            self.timeout,
            "article source",
            self.source.find_articles(keyword, since),
        )
        .await;
        histogram!("scanner_scan_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        let articles = res?;

        counter!("scanner_articles_total").increment(articles.len() as u64);
        tracing::debug!(
            target: "scanner",
            keyword,
            since = %since.to_rfc3339(),
            found = articles.len(),
            source = self.source.name(),
            "scan finished"
        );

        if !articles.is_empty() {
            self.persist(keyword, &articles).await;
        }
        Ok(articles)
    }

    async fn persist(&self, keyword: &str, articles: &[Article]) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = within(self.timeout, "article sink", sink.save(articles)).await {
            counter!("sink_errors_total").increment(1);
            tracing::warn!(
                target: "scanner",
                error = %e,
                keyword,
                sink = sink.name(),
                "saving articles failed"
            );
        }
    }
}
