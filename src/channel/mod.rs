// src/channel/mod.rs
//! Durable, partitioned, at-least-once message channel.
//!
//! Producers append keyed records; the key picks the partition, so records
//! sharing a key keep their relative order. Consumers belong to a group and
//! resume from the group's committed offset, which means anything handed out
//! but not committed is handed out again after a restart.
//!
//! [`SqliteLog`] keeps the channel in a database; [`LogBroker`] keeps it in
//! process memory. [`Channel`] picks one of them at startup.

pub mod broker;
pub mod sqlite;

pub use broker::{LogBroker, LogConsumer};
pub use sqlite::{SqliteConsumer, SqliteLog};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub partition: usize,
    pub offset: u64,
}

/// Where a group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

#[async_trait::async_trait]
pub trait ChannelProducer: Send + Sync {
    /// Append once the record is accepted by the log.
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>)
        -> Result<Position, ChannelError>;
}

#[async_trait::async_trait]
pub trait ChannelConsumer: Send {
    /// Up to `max` records from the assigned partitions, waiting at most
    /// `wait` for something to arrive. An empty batch is not an error.
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Record>, ChannelError>;

    /// Mark everything up to and including each partition's highest offset in
    /// `records` as processed for the group.
    async fn commit(&mut self, records: &[Record]) -> Result<(), ChannelError>;

    /// Move the read position of `partition` so the next poll starts at `offset`.
    fn seek(&mut self, partition: usize, offset: u64) -> Result<(), ChannelError>;

    fn assigned(&self) -> &[usize];

    /// Offset the next poll reads from on `partition`, if it is assigned.
    fn position(&self, partition: usize) -> Option<u64>;
}

pub type BoxConsumer = Box<dyn ChannelConsumer + Sync>;

#[async_trait::async_trait]
impl<C: ChannelConsumer + ?Sized> ChannelConsumer for Box<C> {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Record>, ChannelError> {
        (**self).poll(max, wait).await
    }

    async fn commit(&mut self, records: &[Record]) -> Result<(), ChannelError> {
        (**self).commit(records).await
    }

    fn seek(&mut self, partition: usize, offset: u64) -> Result<(), ChannelError> {
        (**self).seek(partition, offset)
    }

    fn assigned(&self) -> &[usize] {
        (**self).assigned()
    }

    fn position(&self, partition: usize) -> Option<u64> {
        (**self).position(partition)
    }
}

/// The channel a process runs on.
#[derive(Debug, Clone)]
pub enum Channel {
    Memory(LogBroker),
    Sqlite(SqliteLog),
}

impl Channel {
    pub fn is_durable(&self) -> bool {
        matches!(self, Channel::Sqlite(_))
    }

    pub async fn consumer(
        &self,
        group: &str,
        topic: &str,
        member: usize,
        members: usize,
        start: StartOffset,
    ) -> Result<BoxConsumer, ChannelError> {
        let consumer: BoxConsumer = match self {
            Channel::Memory(b) => Box::new(b.consumer(group, topic, member, members, start)?),
            Channel::Sqlite(l) => Box::new(l.consumer(group, topic, member, members, start).await?),
        };
        Ok(consumer)
    }

    pub async fn lag(&self, group: &str, topic: &str) -> Result<u64, ChannelError> {
        match self {
            Channel::Memory(b) => Ok(b.lag(group, topic)),
            Channel::Sqlite(l) => l.lag(group, topic).await,
        }
    }

    pub async fn read_topic(&self, topic: &str) -> Result<Vec<Record>, ChannelError> {
        match self {
            Channel::Memory(b) => Ok(b.read_topic(topic)),
            Channel::Sqlite(l) => l.read_topic(topic).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Channel::Memory(b) => b.close(),
            Channel::Sqlite(l) => l.close().await,
        }
    }
}

#[async_trait::async_trait]
impl ChannelProducer for Channel {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<Position, ChannelError> {
        match self {
            Channel::Memory(b) => b.send(topic, key, payload).await,
            Channel::Sqlite(l) => l.send(topic, key, payload).await,
        }
    }
}

/// Stable key → partition mapping (first 8 bytes of SHA-256).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % partitions as u64) as usize
}

/// Partitions owned by `member` in a group of `members`: `p % members == member`.
pub(crate) fn assignment(partitions: usize, member: usize, members: usize) -> Vec<usize> {
    let members = members.max(1);
    let member = member % members;
    (0..partitions.max(1))
        .filter(|p| p % members == member)
        .collect()
}

/// Highest offset per partition in `records`, as the next offset to read.
pub(crate) fn next_offsets(records: &[Record]) -> Vec<(usize, u64)> {
    let mut out: Vec<(usize, u64)> = Vec::new();
    for r in records {
        match out.iter_mut().find(|(p, _)| *p == r.partition) {
            Some((_, next)) => *next = (*next).max(r.offset + 1),
            None => out.push((r.partition, r.offset + 1)),
        }
    }
    out
}
