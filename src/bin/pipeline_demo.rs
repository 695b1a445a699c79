//! Demo: one sweep over fixture articles, delivered by two log-only workers
//! through an in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use keyword_notifier::config::NotifierConfig;
use keyword_notifier::model::Subscription;
use keyword_notifier::sources::memory::{MemorySink, StaticDirectory};
use keyword_notifier::sources::newsapi::NewsApiSource;
use keyword_notifier::telemetry::init_tracing;
use keyword_notifier::worker::LogDeliverer;
use keyword_notifier::{Collaborators, Pipeline};
use tokio_util::sync::CancellationToken;

const FIXTURE: &str = include_str!("../../tests/fixtures/newsapi_everything.json");

const DEMO_CONFIG: &str = r#"
[channel]
partitions = 4

[worker]
instances = 2
poll_wait_ms = 200

[directory]
url = "memory://demo"

[source]
api_key = "demo"

[state]
persist = false

[admin]
bind = ""
"#;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = NotifierConfig::from_toml_str(DEMO_CONFIG)?;
    let subs = vec![
        Subscription { id: 1, user_id: 7, keyword: "bitcoin".into() },
        Subscription { id: 2, user_id: 9, keyword: "bitcoin".into() },
        Subscription { id: 3, user_id: 9, keyword: "rust".into() },
    ];
    let sink = Arc::new(MemorySink::new());
    let collab = Collaborators {
        directory: Arc::new(StaticDirectory::new(subs)),
        source: Arc::new(NewsApiSource::from_fixture(FIXTURE)),
        sink: Some(sink.clone()),
        deliverer: Arc::new(LogDeliverer),
    };

    let mut pipeline = Pipeline::build(&cfg, collab).await?;
    let seed = Utc
        .with_ymd_and_hms(2023, 12, 31, 0, 0, 0)
        .single()
        .context("seed timestamp")?;
    for keyword in ["bitcoin", "rust"] {
        pipeline.scheduler.clock_mut().advance(keyword, seed).await;
    }

    let cancel = CancellationToken::new();
    let workers: Vec<_> = pipeline
        .workers
        .into_iter()
        .map(|w| w.spawn(cancel.child_token()))
        .collect();

    let report = pipeline.scheduler.sweep(&cancel).await?;
    println!(
        "sweep: {} keywords, {} articles, {} envelopes published",
        report.keywords, report.articles, report.published
    );

    let channel = pipeline.channel;
    let (group, topic) = (&cfg.channel.consumer_group, &cfg.channel.topic);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while channel.lag(group, topic).await? > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for w in workers {
        w.stop().await;
    }
    let undelivered = channel.lag(group, topic).await?;
    channel.close().await;

    println!(
        "pipeline-demo done: {} articles saved, {} left undelivered",
        sink.saved().len(),
        undelivered
    );
    Ok(())
}
