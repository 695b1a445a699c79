// tests/pipeline_app.rs
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use keyword_notifier::config::NotifierConfig;
use keyword_notifier::model::{NotificationEnvelope, Subscription, UserId};
use keyword_notifier::sources::memory::{MemorySink, StaticDirectory};
use keyword_notifier::sources::newsapi::NewsApiSource;
use keyword_notifier::worker::Deliverer;
use keyword_notifier::{Collaborators, Pipeline};

const FIXTURE: &str = include_str!("fixtures/newsapi_everything.json");

#[derive(Default)]
struct Inbox {
    got: Mutex<Vec<(UserId, String)>>,
}

#[async_trait]
impl Deliverer for Inbox {
    async fn deliver(&self, user_id: UserId, env: &NotificationEnvelope) -> Result<()> {
        self.got
            .lock()
            .unwrap()
            .push((user_id, env.article.title.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "inbox"
    }
}

fn config(root: &Path) -> NotifierConfig {
    let body = format!(
        r#"
[channel]
database = '{root}/channel/notifications.db'
partitions = 4

[worker]
instances = 2
poll_wait_ms = 50
retry_backoff_ms = 10

[directory]
url = "memory://test"

[source]
api_key = "test"

[state]
dir = '{root}/state'
"#,
        root = root.display()
    );
    NotifierConfig::from_toml_str(&body).unwrap()
}

fn collaborators(inbox: Arc<Inbox>) -> Collaborators {
    let subs = vec![
        Subscription { id: 1, user_id: 7, keyword: "bitcoin".into() },
        Subscription { id: 2, user_id: 9, keyword: "bitcoin".into() },
    ];
    Collaborators {
        directory: Arc::new(StaticDirectory::new(subs)),
        source: Arc::new(NewsApiSource::from_fixture(FIXTURE)),
        sink: Some(Arc::new(MemorySink::new())),
        deliverer: inbox,
    }
}

#[tokio::test]
async fn first_sweep_is_delivered_and_state_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let inbox = Arc::new(Inbox::default());

    let app = Pipeline::build(&cfg, collaborators(inbox.clone()))
        .await
        .unwrap()
        .start();

    // only the undated fixture article is inside the default lookback
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while inbox.got.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    while app.backlog(&cfg).await.unwrap() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    app.shutdown().await;

    let mut got = inbox.got.lock().unwrap().clone();
    got.sort();
    assert_eq!(
        got,
        vec![
            (7, "Exchange Outage Resolved".to_string()),
            (9, "Exchange Outage Resolved".to_string())
        ]
    );
    assert!(tmp.path().join("state/dedup_clock.json").exists());
    assert!(tmp.path().join("state/seen_events.0.json").exists());
    assert!(tmp.path().join("state/seen_events.1.json").exists());

    let again = Pipeline::build(&cfg, collaborators(Arc::new(Inbox::default())))
        .await
        .unwrap();
    assert!(again.channel.is_durable());
    assert!(again.scheduler.clock().last_checked("bitcoin").is_some());
    assert_eq!(
        again
            .channel
            .lag(&cfg.channel.consumer_group, &cfg.channel.topic)
            .await
            .unwrap(),
        0
    );
    // both envelopes were committed by the only group, so they are gone
    assert!(again
        .channel
        .read_topic(&cfg.channel.topic)
        .await
        .unwrap()
        .is_empty());
    let seen: usize = again.workers.iter().map(|w| w.seen().len()).sum();
    assert_eq!(seen, 2);
}
