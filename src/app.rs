// src/app.rs
//! Process wiring: one scheduler task and a group of delivery workers that
//! share a single channel and only talk to each other through it.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::channel::{
    BoxConsumer, Channel, ChannelConsumer, ChannelProducer, LogBroker, SqliteLog,
};
use crate::clock::{DedupClock, JsonFileClockStore};
use crate::config::NotifierConfig;
use crate::error::ChannelError;
use crate::publisher::Publisher;
use crate::scanner::Scanner;
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerState};
use crate::sources::http::{HttpArticleSink, HttpDirectory};
use crate::sources::newsapi::NewsApiSource;
use crate::sources::{ArticleSink, ArticleSource, SubscriptionDirectory};
use crate::worker::{
    Deliverer, DeliveryWorker, LogDeliverer, SeenEvents, WebhookDeliverer, WorkerHandle,
};

/// The outside world the pipeline talks to.
pub struct Collaborators {
    pub directory: Arc<dyn SubscriptionDirectory>,
    pub source: Arc<dyn ArticleSource>,
    pub sink: Option<Arc<dyn ArticleSink>>,
    pub deliverer: Arc<dyn Deliverer>,
}

impl Collaborators {
    /// HTTP directory, NewsAPI source, optional HTTP sink, and a webhook or
    /// log deliverer depending on `worker.webhook_url`. The webhook makes one
    /// request per worker attempt.
    pub fn from_config(cfg: &NotifierConfig) -> Result<Self> {
        let timeout = cfg.call_timeout();
        let directory = HttpDirectory::new(&cfg.directory.url, timeout)?;
        let source = NewsApiSource::from_url(&cfg.source.base_url, &cfg.source.api_key, timeout)?;
        let sink: Option<Arc<dyn ArticleSink>> = match &cfg.sink.url {
            Some(url) => Some(Arc::new(HttpArticleSink::new(url, timeout)?)),
            None => None,
        };
        let deliverer: Arc<dyn Deliverer> = match &cfg.worker.webhook_url {
            Some(url) => Arc::new(
                WebhookDeliverer::new(url.clone()).with_timeout(cfg.worker.delivery_timeout_secs),
            ),
            None => Arc::new(LogDeliverer),
        };
        Ok(Self {
            directory: Arc::new(directory),
            source: Arc::new(source),
            sink,
            deliverer,
        })
    }
}

/// Everything built but nothing running yet.
pub struct Pipeline {
    pub channel: Channel,
    pub scheduler: Scheduler,
    pub workers: Vec<DeliveryWorker<BoxConsumer>>,
}

impl Pipeline {
    pub async fn build(cfg: &NotifierConfig, collab: Collaborators) -> Result<Self> {
        let channel = match &cfg.channel.database {
            Some(path) => Channel::Sqlite(
                SqliteLog::open(path, cfg.channel.partitions)
                    .await
                    .with_context(|| format!("opening channel database {}", path.display()))?,
            ),
            None => Channel::Memory(LogBroker::in_memory(cfg.channel.partitions)),
        };
        let producer: Arc<dyn ChannelProducer> = Arc::new(channel.clone());

        let clock = match cfg.clock_path() {
            Some(path) => {
                DedupClock::restore(cfg.lookback(), Arc::new(JsonFileClockStore::new(path))).await
            }
            None => DedupClock::new(cfg.lookback()),
        };

        let mut scanner = Scanner::new(collab.source, cfg.call_timeout());
        if let Some(sink) = collab.sink {
            scanner = scanner.with_sink(sink);
        }
        let publisher = Publisher::new(producer.clone(), &cfg.channel.topic, cfg.call_timeout());
        let scheduler = Scheduler::new(
            collab.directory,
            scanner,
            publisher,
            clock,
            cfg.scheduler_cfg(),
        );

        let members = cfg.worker.instances;
        let mut workers = Vec::with_capacity(members);
        for member in 0..members {
            let consumer = channel
                .consumer(
                    &cfg.channel.consumer_group,
                    &cfg.channel.topic,
                    member,
                    members,
                    cfg.channel.start_offset,
                )
                .await
                .with_context(|| format!("joining group {}", cfg.channel.consumer_group))?;
            let wcfg = cfg.worker_cfg(member);
            let seen = match &wcfg.dedup_state_path {
                Some(path) => SeenEvents::restore(
                    path,
                    cfg.dedup_retention(),
                    cfg.worker.dedup_capacity,
                    Utc::now(),
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(target: "app", error = ?e, member, "seen events snapshot unreadable, starting empty");
                    SeenEvents::new(cfg.dedup_retention(), cfg.worker.dedup_capacity)
                }),
                None => SeenEvents::new(cfg.dedup_retention(), cfg.worker.dedup_capacity),
            };
            tracing::info!(
                target: "app",
                member,
                partitions = ?consumer.assigned(),
                restored_seen = seen.len(),
                "worker joined group"
            );
            let worker = DeliveryWorker::new(
                format!("worker-{member}"),
                consumer,
                collab.deliverer.clone(),
                seen,
                wcfg,
            )
            .with_parking(producer.clone());
            workers.push(worker);
        }

        Ok(Self {
            channel,
            scheduler,
            workers,
        })
    }

    /// Spawn workers first so nothing published by the first sweep waits.
    pub fn start(self) -> App {
        let cancel = CancellationToken::new();
        let workers = self
            .workers
            .into_iter()
            .map(|w| w.spawn(cancel.child_token()))
            .collect();
        let scheduler = self.scheduler.spawn(cancel.child_token());
        App {
            channel: self.channel,
            scheduler,
            workers,
            cancel,
        }
    }
}

/// Running pipeline.
pub struct App {
    channel: Channel,
    scheduler: SchedulerHandle,
    workers: Vec<WorkerHandle>,
    cancel: CancellationToken,
}

impl App {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Records of the notification topic not yet committed by the group.
    pub async fn backlog(&self, cfg: &NotifierConfig) -> Result<u64, ChannelError> {
        self.channel
            .lag(&cfg.channel.consumer_group, &cfg.channel.topic)
            .await
    }

    /// Stop publishing, let workers finish their current batch, then close
    /// the channel.
    pub async fn shutdown(self) {
        tracing::info!(target: "app", "shutting down");
        self.scheduler.stop().await;
        for w in self.workers {
            w.stop().await;
        }
        self.cancel.cancel();
        self.channel.close().await;
        tracing::info!(target: "app", "shutdown complete");
    }
}
