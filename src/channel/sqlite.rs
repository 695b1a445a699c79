// src/channel/sqlite.rs
//! Durable channel on a SQLite database through `sqlx`.
//!
//! Tables:
//! - `channel_records`: one row per record, keyed by (topic, part, seq)
//! - `channel_heads`: next sequence number per (topic, part)
//! - `channel_offsets`: committed next sequence per (group, topic, part)
//! - `channel_groups`: groups that ever joined a topic
//!
//! Committing trims records below the lowest committed offset across the
//! topic's groups, so the table only holds what some group still needs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Notify;

use super::{
    next_offsets, partition_for, ChannelConsumer, ChannelProducer, Position, Record, StartOffset,
};
use crate::error::ChannelError;

/// Re-check interval while waiting, for records appended by another process.
const REFRESH: Duration = Duration::from_millis(250);

const SCHEMA: [&str; 5] = [
    r#"CREATE TABLE IF NOT EXISTS channel_meta (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_heads (
        topic TEXT NOT NULL,
        part INTEGER NOT NULL,
        next_seq INTEGER NOT NULL,
        PRIMARY KEY (topic, part)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_records (
        topic TEXT NOT NULL,
        part INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        msg_key TEXT NOT NULL,
        payload BLOB NOT NULL,
        appended_at TEXT NOT NULL,
        PRIMARY KEY (topic, part, seq)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_groups (
        grp TEXT NOT NULL,
        topic TEXT NOT NULL,
        PRIMARY KEY (grp, topic)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS channel_offsets (
        grp TEXT NOT NULL,
        topic TEXT NOT NULL,
        part INTEGER NOT NULL,
        next_seq INTEGER NOT NULL,
        PRIMARY KEY (grp, topic, part)
    )"#,
];

fn db(e: sqlx::Error) -> ChannelError {
    match e {
        sqlx::Error::PoolClosed => ChannelError::Closed,
        other => ChannelError::Database(other),
    }
}

#[derive(Debug)]
struct Inner {
    pool: SqlitePool,
    partitions: usize,
    appended: Notify,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct SqliteLog {
    inner: Arc<Inner>,
}

impl SqliteLog {
    /// Open (or create) the channel database at `path`.
    ///
    /// A database created with a different partition count is refused: keys
    /// would land on other partitions and per-user order would break.
    pub async fn open(path: &Path, partitions: usize) -> Result<Self, ChannelError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ChannelError::Layout(format!("creating {}: {e}", dir.display())))?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(db)?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await.map_err(db)?;
        }

        let partitions = partitions.max(1);
        sqlx::query("INSERT OR IGNORE INTO channel_meta (name, value) VALUES ('partitions', ?1)")
            .bind(partitions as i64)
            .execute(&pool)
            .await
            .map_err(db)?;
        let stored: i64 =
            sqlx::query_scalar("SELECT value FROM channel_meta WHERE name = 'partitions'")
                .fetch_one(&pool)
                .await
                .map_err(db)?;
        if stored != partitions as i64 {
            pool.close().await;
            return Err(ChannelError::Layout(format!(
                "{} was created with {stored} partitions, configured {partitions}",
                path.display()
            )));
        }

        tracing::info!(target: "channel", path = %path.display(), partitions, "channel database open");
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                partitions,
                appended: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Refuse further sends, wake waiting consumers and close the pool.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
        self.inner.pool.close().await;
    }

    /// Consumer for member `member` of a group with `members` members.
    /// Partition `p` belongs to member `p % members`.
    pub async fn consumer(
        &self,
        group: &str,
        topic: &str,
        member: usize,
        members: usize,
        start: StartOffset,
    ) -> Result<SqliteConsumer, ChannelError> {
        let assigned = super::assignment(self.inner.partitions, member, members);
        let pool = &self.inner.pool;

        sqlx::query("INSERT OR IGNORE INTO channel_groups (grp, topic) VALUES (?1, ?2)")
            .bind(group)
            .bind(topic)
            .execute(pool)
            .await
            .map_err(db)?;

        let mut positions = HashMap::new();
        for &p in &assigned {
            let pos = match self.committed(group, topic, p).await? {
                Some(next) => next,
                None => match start {
                    StartOffset::Earliest => 0,
                    StartOffset::Latest => self.end_offset(topic, p).await?,
                },
            };
            positions.insert(p, pos);
        }

        Ok(SqliteConsumer {
            log: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            assigned,
            positions,
            cursor: 0,
        })
    }

    pub async fn committed(
        &self,
        group: &str,
        topic: &str,
        partition: usize,
    ) -> Result<Option<u64>, ChannelError> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_seq FROM channel_offsets WHERE grp = ?1 AND topic = ?2 AND part = ?3",
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i64)
        .fetch_optional(&self.inner.pool)
        .await
        .map_err(db)?;
        Ok(next.map(|n| n as u64))
    }

    /// Offset the next record appended to `partition` will get.
    pub async fn end_offset(&self, topic: &str, partition: usize) -> Result<u64, ChannelError> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT next_seq FROM channel_heads WHERE topic = ?1 AND part = ?2")
                .bind(topic)
                .bind(partition as i64)
                .fetch_optional(&self.inner.pool)
                .await
                .map_err(db)?;
        Ok(next.unwrap_or(0) as u64)
    }

    /// Records still held for `partition`.
    pub async fn retained(&self, topic: &str, partition: usize) -> Result<u64, ChannelError> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM channel_records WHERE topic = ?1 AND part = ?2")
                .bind(topic)
                .bind(partition as i64)
                .fetch_one(&self.inner.pool)
                .await
                .map_err(db)?;
        Ok(n as u64)
    }

    /// Records not yet committed by `group`, summed over partitions.
    pub async fn lag(&self, group: &str, topic: &str) -> Result<u64, ChannelError> {
        let lag: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(MAX(h.next_seq - COALESCE(
                o.next_seq,
                (SELECT MIN(r.seq) FROM channel_records r WHERE r.topic = h.topic AND r.part = h.part),
                h.next_seq
            ), 0)), 0)
            FROM channel_heads h
            LEFT JOIN channel_offsets o
              ON o.grp = ?1 AND o.topic = h.topic AND o.part = h.part
            WHERE h.topic = ?2
            "#,
        )
        .bind(group)
        .bind(topic)
        .fetch_one(&self.inner.pool)
        .await
        .map_err(db)?;
        Ok(lag.max(0) as u64)
    }

    /// Retained records of a topic, partition by partition.
    pub async fn read_topic(&self, topic: &str) -> Result<Vec<Record>, ChannelError> {
        let rows = sqlx::query(
            r#"
            SELECT part, seq, msg_key, payload, appended_at
            FROM channel_records
            WHERE topic = ?1
            ORDER BY part, seq
            "#,
        )
        .bind(topic)
        .fetch_all(&self.inner.pool)
        .await
        .map_err(db)?;
        rows.iter().map(|row| to_record(topic, row)).collect()
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: usize,
        from: u64,
        limit: usize,
    ) -> Result<Vec<Record>, ChannelError> {
        let rows = sqlx::query(
            r#"
            SELECT part, seq, msg_key, payload, appended_at
            FROM channel_records
            WHERE topic = ?1 AND part = ?2 AND seq >= ?3
            ORDER BY seq
            LIMIT ?4
            "#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(from as i64)
        .bind(limit as i64)
        .fetch_all(&self.inner.pool)
        .await
        .map_err(db)?;
        rows.iter().map(|row| to_record(topic, row)).collect()
    }

    async fn commit_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &[(usize, u64)],
    ) -> Result<(), ChannelError> {
        let mut tx = self.inner.pool.begin().await.map_err(db)?;
        for &(p, next) in offsets {
            sqlx::query(
                r#"
                INSERT INTO channel_offsets (grp, topic, part, next_seq) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (grp, topic, part) DO UPDATE SET next_seq = excluded.next_seq
                "#,
            )
            .bind(group)
            .bind(topic)
            .bind(p as i64)
            .bind(next as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            // a group that joined but never committed here holds the floor at 0
            let trimmed = sqlx::query(
                r#"
                DELETE FROM channel_records
                WHERE topic = ?1 AND part = ?2 AND seq < (
                    SELECT MIN(COALESCE(o.next_seq, 0))
                    FROM channel_groups g
                    LEFT JOIN channel_offsets o
                      ON o.grp = g.grp AND o.topic = g.topic AND o.part = ?2
                    WHERE g.topic = ?1
                )
                "#,
            )
            .bind(topic)
            .bind(p as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?
            .rows_affected();
            if trimmed > 0 {
                tracing::debug!(target: "channel", topic, partition = p, trimmed, "trimmed committed records");
            }
        }
        tx.commit().await.map_err(db)
    }
}

#[async_trait::async_trait]
impl ChannelProducer for SqliteLog {
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

        let mut tx = self.inner.pool.begin().await.map_err(db)?;
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO channel_heads (topic, part, next_seq) VALUES (?1, ?2, 1)
            ON CONFLICT (topic, part) DO UPDATE SET next_seq = next_seq + 1
            RETURNING next_seq - 1
            "#,
        )
        .bind(topic)
        .bind(partition as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        sqlx::query(
            r#"
            INSERT INTO channel_records (topic, part, seq, msg_key, payload, appended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(seq)
        .bind(key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        self.inner.appended.notify_waiters();
        Ok(Position {
            partition,
            offset: seq as u64,
        })
    }
}

/// One group member's view of a topic stored in SQLite.
#[derive(Debug)]
pub struct SqliteConsumer {
    log: SqliteLog,
    group: String,
    topic: String,
    assigned: Vec<usize>,
    positions: HashMap<usize, u64>,
    cursor: usize,
}

impl SqliteConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn fetch(&mut self, max: usize) -> Result<Vec<Record>, ChannelError> {
        let mut out = Vec::new();
        let n = self.assigned.len();
        for i in 0..n {
            if out.len() >= max {
                break;
            }
            let p = self.assigned[(self.cursor + i) % n];
            let from = self.positions.get(&p).copied().unwrap_or(0);
            let batch = self.log.fetch(&self.topic, p, from, max - out.len()).await?;
            if let Some(last) = batch.last() {
                self.positions.insert(p, last.offset + 1);
            }
            out.extend(batch);
        }
        self.cursor = (self.cursor + 1) % n;
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ChannelConsumer for SqliteConsumer {
    async fn poll(&mut self, max: usize, wait: Duration) -> Result<Vec<Record>, ChannelError> {
        if max == 0 || self.assigned.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let inner = Arc::clone(&self.log.inner);
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.log.is_closed() {
                return Err(ChannelError::Closed);
            }
            let batch = self.fetch(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = deadline.min(now + REFRESH);
            let _ = tokio::time::timeout_at(wake, notified).await;
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
        self.log
            .commit_offsets(&self.group, &self.topic, &offsets)
            .await
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

fn to_record(topic: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Record, ChannelError> {
    let part: i64 = row.try_get("part").map_err(db)?;
    let seq: i64 = row.try_get("seq").map_err(db)?;
    let appended_at: DateTime<Utc> = row.try_get("appended_at").map_err(db)?;
    Ok(Record {
        topic: topic.to_string(),
        partition: part as usize,
        offset: seq as u64,
        key: row.try_get("msg_key").map_err(db)?,
        payload: row.try_get("payload").map_err(db)?,
        appended_at,
    })
}
