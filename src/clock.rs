// src/clock.rs
//! Per-keyword scan bounds.
//!
//! A keyword's mark is the start time of the last sweep in which its scan
//! succeeded. Keywords without a mark look back `lookback` from "now".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::fs;

pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

pub type Marks = HashMap<String, DateTime<Utc>>;

#[async_trait::async_trait]
pub trait ClockStore: Send + Sync {
    async fn load(&self) -> Result<Marks>;
    async fn save(&self, marks: &Marks) -> Result<()>;
}

/// Marks kept as a pretty-printed JSON object `{keyword: rfc3339}`.
#[derive(Debug, Clone)]
pub struct JsonFileClockStore {
    path: PathBuf,
}

impl JsonFileClockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ClockStore for JsonFileClockStore {
    async fn load(&self) -> Result<Marks> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Marks::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let entries: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        // one bad entry only costs that keyword its mark
        let mut marks = Marks::new();
        for (keyword, value) in entries {
            let parsed = value
                .as_str()
                .map(DateTime::parse_from_rfc3339)
                .and_then(Result::ok);
            match parsed {
                Some(at) => {
                    marks.insert(keyword, at.with_timezone(&Utc));
                }
                None => tracing::warn!(
                    target: "clock",
                    keyword = %keyword,
                    value = %value,
                    "unreadable scan mark dropped"
                ),
            }
        }
        Ok(marks)
    }

    async fn save(&self, marks: &Marks) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        // write-then-rename so a crash never leaves half a file behind
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(marks)?)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

pub struct DedupClock {
    marks: Marks,
    lookback: ChronoDuration,
    store: Option<Arc<dyn ClockStore>>,
}

impl std::fmt::Debug for DedupClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupClock")
            .field("marks", &self.marks)
            .field("lookback", &self.lookback)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for DedupClock {
    fn default() -> Self {
        Self::new(ChronoDuration::hours(DEFAULT_LOOKBACK_HOURS))
    }
}

impl DedupClock {
    /// Memory-only clock. A non-positive `lookback` falls back to the default.
    pub fn new(lookback: ChronoDuration) -> Self {
        let lookback = if lookback <= ChronoDuration::zero() {
            ChronoDuration::hours(DEFAULT_LOOKBACK_HOURS)
        } else {
            lookback
        };
        Self {
            marks: Marks::new(),
            lookback,
            store: None,
        }
    }

    /// Clock backed by `store`. An unreadable store starts the clock empty,
    /// which only widens the next scan to the default lookback.
    pub async fn restore(lookback: ChronoDuration, store: Arc<dyn ClockStore>) -> Self {
        let mut clock = Self::new(lookback);
        match store.load().await {
            Ok(marks) => {
                tracing::info!(target: "clock", keywords = marks.len(), "restored scan marks");
                clock.marks = marks;
            }
            Err(e) => {
                tracing::warn!(target: "clock", error = ?e, "scan marks unreadable, starting empty");
            }
        }
        clock.store = Some(store);
        clock
    }

    /// Lower bound for the next scan of `keyword`.
    pub fn bound(&self, keyword: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        self.marks
            .get(keyword)
            .copied()
            .unwrap_or_else(|| now - self.lookback)
    }

    pub fn last_checked(&self, keyword: &str) -> Option<DateTime<Utc>> {
        self.marks.get(keyword).copied()
    }

    pub fn lookback(&self) -> ChronoDuration {
        self.lookback
    }

    /// Overwrite the mark for `keyword`. Persisting is best-effort: the
    /// in-memory mark is authoritative for the running process.
    pub async fn advance(&mut self, keyword: &str, at: DateTime<Utc>) {
        self.marks.insert(keyword.to_string(), at);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.marks).await {
                tracing::warn!(target: "clock", error = ?e, keyword, "persisting scan marks failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unknown_keyword_looks_back_one_day() {
        let clock = DedupClock::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(
            clock.bound("bitcoin", now),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn non_positive_lookback_uses_default() {
        let clock = DedupClock::new(ChronoDuration::zero());
        assert_eq!(clock.lookback(), ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn advance_overwrites_unconditionally() {
        let mut clock = DedupClock::default();
        let later = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        clock.advance("rust", later).await;
        clock.advance("rust", earlier).await;
        assert_eq!(clock.bound("rust", Utc::now()), earlier);
    }

    #[tokio::test]
    async fn marks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ClockStore> =
            Arc::new(JsonFileClockStore::new(dir.path().join("state/clock.json")));
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let mut clock = DedupClock::restore(ChronoDuration::hours(24), store.clone()).await;
        clock.advance("bitcoin", at).await;
        drop(clock);

        let clock = DedupClock::restore(ChronoDuration::hours(24), store).await;
        assert_eq!(clock.last_checked("bitcoin"), Some(at));
    }

    #[tokio::test]
    async fn bad_entry_only_loses_its_own_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.json");
        std::fs::write(
            &path,
            r#"{"bitcoin":"2024-01-01T00:00:00Z","rust":"garbage","go":42}"#,
        )
        .unwrap();

        let clock =
            DedupClock::restore(ChronoDuration::hours(24), Arc::new(JsonFileClockStore::new(&path)))
                .await;
        assert_eq!(
            clock.last_checked("bitcoin"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(clock.last_checked("rust"), None);
        assert_eq!(clock.last_checked("go"), None);

        let now = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        assert_eq!(clock.bound("rust", now), now - ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn corrupt_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clock.json");
        std::fs::write(&path, "{not json").unwrap();
        let clock =
            DedupClock::restore(ChronoDuration::hours(24), Arc::new(JsonFileClockStore::new(&path)))
                .await;
        assert_eq!(clock.last_checked("bitcoin"), None);
    }
}
