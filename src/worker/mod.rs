// src/worker/mod.rs
//! Consumer side of the channel.
//!
//! A worker polls a commit group of records, handles them in partition order
//! and commits once the group is handled. Handled means delivered, recognised
//! as a duplicate, or parked on the dead-letter topic. A record that can be
//! none of these is not committed and its partition is rewound to it.

pub mod dedup;
pub mod delivery;

pub use dedup::SeenEvents;
pub use delivery::{Deliverer, LogDeliverer, WebhookDeliverer};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelConsumer, ChannelProducer, Record};
use crate::error::{within, ChannelError};
use crate::model::NotificationEnvelope;

#[derive(Clone, Debug)]
pub struct WorkerCfg {
    pub batch_size: usize,
    pub poll_wait: Duration,
    /// Delivery attempts per envelope before it is parked.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub delivery_timeout: Duration,
    pub dead_letter_topic: Option<String>,
    pub dedup_state_path: Option<PathBuf>,
}

impl Default for WorkerCfg {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_wait: Duration::from_secs(1),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            delivery_timeout: Duration::from_secs(10),
            dead_letter_topic: Some("notifications.parked".to_string()),
            dedup_state_path: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// Same event id already delivered within the retention window.
    Duplicate,
    /// Unprocessable and no dead-letter topic configured.
    Dropped,
    Parked,
    /// Neither delivered nor parked; must be read again.
    Retry,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub polled: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub parked: usize,
    pub held_back: usize,
}

/// Body of a record on the dead-letter topic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParkedMessage {
    pub reason: String,
    pub attempts: u32,
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub raw: String,
    pub parked_at: DateTime<Utc>,
}

pub struct DeliveryWorker<C: ChannelConsumer> {
    name: String,
    consumer: C,
    deliverer: Arc<dyn Deliverer>,
    parking: Option<Arc<dyn ChannelProducer>>,
    seen: SeenEvents,
    cfg: WorkerCfg,
}

impl<C: ChannelConsumer> DeliveryWorker<C> {
    pub fn new(
        name: impl Into<String>,
        consumer: C,
        deliverer: Arc<dyn Deliverer>,
        seen: SeenEvents,
        cfg: WorkerCfg,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            deliverer,
            parking: None,
            seen,
            cfg,
        }
    }

    /// Producer used to park records on `cfg.dead_letter_topic`.
    pub fn with_parking(mut self, producer: Arc<dyn ChannelProducer>) -> Self {
        self.parking = Some(producer);
        self
    }

    pub fn seen(&self) -> &SeenEvents {
        &self.seen
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Handle one record. Never fails: the outcome says what happened.
    pub async fn process(&mut self, record: &Record) -> Outcome {
        let env = match NotificationEnvelope::decode(&record.payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(
                    target: "worker",
                    worker = %self.name,
                    error = %e,
                    partition = record.partition,
                    offset = record.offset,
                    "undecodable record"
                );
                return self.park_or_drop(record, format!("decode: {e}"), 0).await;
            }
        };
        let Some(user_id) = env.recipient(&record.key) else {
            tracing::warn!(
                target: "worker",
                worker = %self.name,
                event_id = %env.event_id,
                key = %record.key,
                "envelope without recipient"
            );
            return self
                .park_or_drop(record, "no recipient".to_string(), 0)
                .await;
        };

        if self.seen.contains(&env.event_id, Utc::now()) {
            counter!("worker_duplicates_total").increment(1);
            tracing::info!(
                target: "worker",
                worker = %self.name,
                event_id = %env.event_id,
                user_id,
                "redelivered envelope skipped"
            );
            return Outcome::Duplicate;
        }

        let max_attempts = self.cfg.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match within(
                self.cfg.delivery_timeout,
                "delivery",
                self.deliverer.deliver(user_id, &env),
            )
            .await
            {
                Ok(()) => {
                    self.seen.insert(&env.event_id, Utc::now());
                    counter!("worker_delivered_total").increment(1);
                    return Outcome::Delivered;
                }
                Err(e) => {
                    counter!("worker_delivery_errors_total").increment(1);
                    tracing::warn!(
                        target: "worker",
                        worker = %self.name,
                        event_id = %env.event_id,
                        user_id,
                        attempt,
                        deliverer = self.deliverer.name(),
                        error = %e,
                        "delivery attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.cfg.retry_backoff * attempt).await;
                    }
                }
            }
        }

        self.park_or_drop(record, format!("delivery: {last_error}"), max_attempts)
            .await
    }

    async fn park_or_drop(&self, record: &Record, reason: String, attempts: u32) -> Outcome {
        let (Some(topic), Some(producer)) = (&self.cfg.dead_letter_topic, &self.parking) else {
            counter!("worker_dropped_total").increment(1);
            tracing::error!(
                target: "worker",
                worker = %self.name,
                partition = record.partition,
                offset = record.offset,
                reason = %reason,
                "dropping record, no dead-letter topic"
            );
            return Outcome::Dropped;
        };

        let parked = ParkedMessage {
            reason,
            attempts,
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            raw: String::from_utf8_lossy(&record.payload).into_owned(),
            parked_at: Utc::now(),
        };
        let body = match serde_json::to_vec(&parked) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(target: "worker", error = %e, "encoding parked message");
                return Outcome::Retry;
            }
        };
        match producer.send(topic, &record.key, body).await {
            Ok(_) => {
                counter!("worker_parked_total").increment(1);
                tracing::warn!(
                    target: "worker",
                    worker = %self.name,
                    partition = record.partition,
                    offset = record.offset,
                    dead_letter = %topic,
                    reason = %parked.reason,
                    "record parked"
                );
                Outcome::Parked
            }
            Err(e) => {
                tracing::error!(
                    target: "worker",
                    worker = %self.name,
                    error = %e,
                    "parking failed, record will be read again"
                );
                Outcome::Retry
            }
        }
    }

    /// Poll one commit group and handle it.
    pub async fn run_batch(&mut self) -> Result<BatchReport, ChannelError> {
        let records = self
            .consumer
            .poll(self.cfg.batch_size, self.cfg.poll_wait)
            .await?;
        self.handle_batch(records).await
    }

    async fn handle_batch(&mut self, records: Vec<Record>) -> Result<BatchReport, ChannelError> {
        let mut report = BatchReport {
            polled: records.len(),
            ..BatchReport::default()
        };
        let mut done = Vec::with_capacity(records.len());
        let mut held: Vec<usize> = Vec::new();

        for rec in records {
            if held.contains(&rec.partition) {
                continue;
            }
            match self.process(&rec).await {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Duplicate => report.duplicates += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Parked => report.parked += 1,
                Outcome::Retry => {
                    report.held_back += 1;
                    self.consumer.seek(rec.partition, rec.offset)?;
                    held.push(rec.partition);
                    continue;
                }
            }
            done.push(rec);
        }

        if !done.is_empty() {
            // dedup state first: a crash after this point redelivers duplicates only
            self.persist_seen().await;
            self.consumer.commit(&done).await?;
        }
        if !held.is_empty() {
            tokio::time::sleep(self.cfg.retry_backoff).await;
        }
        Ok(report)
    }

    async fn persist_seen(&self) {
        if let Some(path) = &self.cfg.dedup_state_path {
            if let Err(e) = self.seen.persist(path).await {
                tracing::warn!(target: "worker", worker = %self.name, error = ?e, "persisting seen events failed");
            }
        }
    }

    /// Consume until `cancel` fires or the channel closes. A batch already
    /// polled is always handled and committed before stopping.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(target: "worker", worker = %self.name, "delivery worker started");
        let (max, wait) = (self.cfg.batch_size, self.cfg.poll_wait);

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.consumer.poll(max, wait) => res,
            };
            let res = match polled {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => self.handle_batch(records).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(report) => tracing::debug!(
                    target: "worker",
                    worker = %self.name,
                    polled = report.polled,
                    delivered = report.delivered,
                    duplicates = report.duplicates,
                    parked = report.parked,
                    dropped = report.dropped,
                    held_back = report.held_back,
                    "batch handled"
                ),
                Err(ChannelError::Closed) => {
                    tracing::info!(target: "worker", worker = %self.name, "channel closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(target: "worker", worker = %self.name, error = %e, "channel error");
                    tokio::time::sleep(self.cfg.retry_backoff).await;
                }
            }
        }

        self.persist_seen().await;
        tracing::info!(target: "worker", worker = %self.name, "delivery worker stopped");
    }
}

impl<C: ChannelConsumer + Sync + 'static> DeliveryWorker<C> {
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
        let join = tokio::spawn(self.run(cancel.clone()));
        WorkerHandle { cancel, join }
    }
}

pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(target: "worker", error = ?e, "worker task panicked");
        }
    }
}
