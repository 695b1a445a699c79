// src/channel/broker.rs
//! In-process partitioned log.
//!
//! Same contract as the SQLite channel but nothing survives the process. Used
//! by the demo, by tests, and when no channel database is configured.
//! Records every known group has committed are trimmed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{
    next_offsets, partition_for, ChannelConsumer, ChannelProducer, Position, Record, StartOffset,
};
use crate::error::ChannelError;

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    payload: Vec<u8>,
    appended_at: DateTime<Utc>,
}

/// Retained entries; `base` is the offset of the front entry.
#[derive(Debug, Default)]
struct Partition {
    base: u64,
    entries: VecDeque<Entry>,
}

impl Partition {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn trim_below(&mut self, floor: u64) -> usize {
        let mut trimmed = 0;
        while self.base < floor && self.entries.pop_front().is_some() {
            self.base += 1;
            trimmed += 1;
        }
        trimmed
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Partition>>,
    committed: HashMap<(String, String, usize), u64>,
    /// (group, topic) pairs that ever opened a consumer.
    groups: HashSet<(String, String)>,
}

impl State {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Partition> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Partition::default()).collect())
    }

    /// Lowest committed offset of `partition` across the topic's groups.
    fn floor(&self, topic: &str, partition: usize) -> Option<u64> {
        self.groups
            .iter()
            .filter(|(_, t)| t == topic)
            .map(|(g, t)| {
                self.committed
                    .get(&(g.clone(), t.clone(), partition))
                    .copied()
                    .unwrap_or(0)
            })
            .min()
    }
}

#[derive(Debug)]
struct Inner {
    partitions: usize,
    state: Mutex<State>,
    appended: Notify,
    closed: AtomicBool,
}

/// Shared handle to the log. Cloning is cheap; all clones see the same data.
#[derive(Debug, Clone)]
pub struct LogBroker {
    inner: Arc<Inner>,
}

impl LogBroker {
    pub fn in_memory(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// Refuse further sends and wake every waiting consumer.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Consumer for member `member` of a group with `members` members.
    /// Partition `p` belongs to member `p % members`.
    pub fn consumer(
        &self,
        group: &str,
        topic: &str,
        member: usize,
        members: usize,
        start: StartOffset,
    ) -> Result<LogConsumer, ChannelError> {
        let assigned = super::assignment(self.inner.partitions, member, members);

        let mut state = self.lock();
        state.groups.insert((group.to_string(), topic.to_string()));
        let bounds: Vec<(u64, u64)> = state
            .topic_mut(topic, self.inner.partitions)
            .iter()
            .map(|p| (p.base, p.end()))
            .collect();

        let mut positions = HashMap::new();
        for &p in &assigned {
            let committed = state
                .committed
                .get(&(group.to_string(), topic.to_string(), p))
                .copied();
            let (base, end) = bounds[p];
            let pos = committed.unwrap_or(match start {
                StartOffset::Earliest => base,
                StartOffset::Latest => end,
            });
            positions.insert(p, pos);
        }

        Ok(LogConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            assigned,
            positions,
            cursor: 0,
        })
    }

    pub fn committed(&self, group: &str, topic: &str, partition: usize) -> Option<u64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Offset the next record appended to `partition` will get.
    pub fn end_offset(&self, topic: &str, partition: usize) -> u64 {
        self.lock()
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition))
            .map_or(0, Partition::end)
    }

    /// Records still held for `partition`.
    pub fn retained(&self, topic: &str, partition: usize) -> usize {
        self.lock()
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition))
            .map_or(0, |p| p.entries.len())
    }

    /// Records not yet committed by `group`, summed over partitions.
    pub fn lag(&self, group: &str, topic: &str) -> u64 {
        let state = self.lock();
        let Some(parts) = state.topics.get(topic) else {
            return 0;
        };
        parts
            .iter()
            .enumerate()
            .map(|(p, part)| {
                let done = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), p))
                    .copied()
                    .unwrap_or(part.base);
                part.end().saturating_sub(done)
            })
            .sum()
    }

    /// Retained records of one partition, for inspection (e.g. parked messages).
    pub fn read_partition(&self, topic: &str, partition: usize) -> Vec<Record> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition))
            .map(|part| {
                part.entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| to_record(topic, partition, part.base + i as u64, e))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Retained records of a topic, partition by partition.
    pub fn read_topic(&self, topic: &str) -> Vec<Record> {
        (0..self.inner.partitions)
            .flat_map(|p| self.read_partition(topic, p))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("channel mutex poisoned")
    }

    fn commit_offsets(&self, group: &str, topic: &str, offsets: &[(usize, u64)]) {
        let mut state = self.lock();
        for &(p, next) in offsets {
            state
                .committed
                .insert((group.to_string(), topic.to_string(), p), next);
        }
        let floors: Vec<(usize, u64)> = offsets
            .iter()
            .filter_map(|&(p, _)| state.floor(topic, p).map(|f| (p, f)))
            .collect();
        let parts = state.topic_mut(topic, self.inner.partitions);
        for (p, floor) in floors {
            let trimmed = parts[p].trim_below(floor);
            if trimmed > 0 {
                tracing::debug!(target: "channel", topic, partition = p, trimmed, "trimmed committed records");
            }
        }
    }

    fn fetch(
        &self,
        topic: &str,
        assigned: &[usize],
        positions: &mut HashMap<usize, u64>,
        start_at: usize,
        max: usize,
    ) -> Vec<Record> {
        let mut state = self.lock();
        let parts = state.topic_mut(topic, self.inner.partitions);
        let mut out = Vec::new();
        for i in 0..assigned.len() {
            if out.len() >= max {
                break;
            }
            let p = assigned[(start_at + i) % assigned.len()];
            let part = &parts[p];
            let pos = positions.entry(p).or_insert(part.base);
            if *pos < part.base {
                *pos = part.base;
            }
            while *pos < part.end() && out.len() < max {
                let e = &part.entries[(*pos - part.base) as usize];
                out.push(to_record(topic, p, *pos, e));
                *pos += 1;
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl ChannelProducer for LogBroker {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<Position, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let partition = partition_for(key, self.inner.partitions);
        let entry = Entry {
            key: key.to_string(),
            payload,
            appended_at: Utc::now(),
        };

        let offset = {
            let mut state = self.lock();
            let part = &mut state.topic_mut(topic, self.inner.partitions)[partition];
            part.entries.push_back(entry);
            part.end() - 1
        };

        self.inner.appended.notify_waiters();
        Ok(Position { partition, offset })
    }
}

/// One group member's view of a topic.
#[derive(Debug)]
pub struct LogConsumer {
    broker: LogBroker,
    group: String,
    topic: String,
    assigned: Vec<usize>,
    positions: HashMap<usize, u64>,
    cursor: usize,
}

impl LogConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait::async_trait]
impl ChannelConsumer for LogConsumer {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Record>, ChannelError> {
        if max == 0 || self.assigned.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // register interest before looking, so an append in between is not missed
            let notified = self.broker.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.broker.is_closed() {
                return Err(ChannelError::Closed);
            }
            let start_at = self.cursor;
            let batch = self.broker.fetch(
                &self.topic,
                &self.assigned,
                &mut self.positions,
                start_at,
                max,
            );
            self.cursor = (self.cursor + 1) % self.assigned.len();
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, records: &[Record]) -> Result<(), ChannelError> {
        let offsets = next_offsets(records);
        if offsets.is_empty() {
            return Ok(());
        }
        if let Some((p, _)) = offsets.iter().find(|(p, _)| !self.assigned.contains(p)) {
            return Err(ChannelError::UnknownPartition(*p));
        }
        self.broker.commit_offsets(&self.group, &self.topic, &offsets);
        Ok(())
    }

    fn seek(&mut self, partition: usize, offset: u64) -> Result<(), ChannelError> {
        if !self.assigned.contains(&partition) {
            return Err(ChannelError::UnknownPartition(partition));
        }
        self.positions.insert(partition, offset);
        Ok(())
    }

    fn assigned(&self) -> &[usize] {
        &self.assigned
    }

    fn position(&self, partition: usize) -> Option<u64> {
        self.positions.get(&partition).copied()
    }
}

fn to_record(topic: &str, partition: usize, offset: u64, e: &Entry) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: e.key.clone(),
        payload: e.payload.clone(),
        appended_at: e.appended_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimming_moves_the_base() {
        let mut part = Partition::default();
        for i in 0..4u8 {
            part.entries.push_back(Entry {
                key: "k".into(),
                payload: vec![i],
                appended_at: Utc::now(),
            });
        }
        assert_eq!(part.trim_below(3), 3);
        assert_eq!(part.base, 3);
        assert_eq!(part.end(), 4);
        assert_eq!(part.trim_below(10), 1);
        assert_eq!(part.end(), 4);
    }
}
