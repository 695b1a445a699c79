// src/worker/dedup.rs
//! Recently delivered event ids.
//!
//! Bounded two ways: entries older than `retention` no longer count, and past
//! `capacity` the oldest entries are evicted first.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct SeenEvents {
    retention: ChronoDuration,
    capacity: usize,
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(String, DateTime<Utc>)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    event_id: String,
    delivered_at: DateTime<Utc>,
}

impl SeenEvents {
    pub fn new(retention: ChronoDuration, capacity: usize) -> Self {
        Self {
            retention,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, event_id: &str, now: DateTime<Utc>) -> bool {
        self.seen
            .get(event_id)
            .is_some_and(|at| now.signed_duration_since(*at) <= self.retention)
    }

    pub fn insert(&mut self, event_id: &str, now: DateTime<Utc>) {
        self.prune(now);
        self.seen.insert(event_id.to_string(), now);
        self.order.push_back((event_id.to_string(), now));
        while self.seen.len() > self.capacity {
            self.evict_front();
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((_, at)) = self.order.front() {
            if now.signed_duration_since(*at) <= self.retention {
                break;
            }
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some((id, at)) = self.order.pop_front() {
            // only forget the id if it was not re-inserted later
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
            }
        }
    }

    /// Load a snapshot written by [`SeenEvents::persist`]. A missing file is
    /// an empty set.
    pub async fn restore(
        path: &Path,
        retention: ChronoDuration,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut out = Self::new(retention, capacity);
        let raw = match fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let mut entries: Vec<SnapshotEntry> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        entries.sort_by_key(|e| e.delivered_at);
        for e in entries {
            if now.signed_duration_since(e.delivered_at) <= retention {
                out.seen.insert(e.event_id.clone(), e.delivered_at);
                out.order.push_back((e.event_id, e.delivered_at));
            }
        }
        while out.seen.len() > out.capacity {
            out.evict_front();
        }
        Ok(out)
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let entries: Vec<SnapshotEntry> = self
            .order
            .iter()
            .filter(|(id, at)| self.seen.get(id) == Some(at))
            .map(|(id, at)| SnapshotEntry {
                event_id: id.clone(),
                delivered_at: *at,
            })
            .collect();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&entries)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    #[test]
    fn expires_after_retention() {
        let mut seen = SeenEvents::new(ChronoDuration::minutes(10), 100);
        seen.insert("a", t(0));
        assert!(seen.contains("a", t(10)));
        assert!(!seen.contains("a", t(11)));
        seen.insert("b", t(20));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut seen = SeenEvents::new(ChronoDuration::hours(1), 2);
        seen.insert("a", t(0));
        seen.insert("b", t(1));
        seen.insert("c", t(2));
        assert!(!seen.contains("a", t(3)));
        assert!(seen.contains("b", t(3)));
        assert!(seen.contains("c", t(3)));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        let mut seen = SeenEvents::new(ChronoDuration::minutes(30), 10);
        seen.insert("old", t(0));
        seen.insert("new", t(25));
        seen.persist(&path).await.unwrap();

        let back = SeenEvents::restore(&path, ChronoDuration::minutes(30), 10, t(40))
            .await
            .unwrap();
        assert!(!back.contains("old", t(40)));
        assert!(back.contains("new", t(40)));
        assert_eq!(back.len(), 1);
    }
}
