// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::StartOffset;
use crate::scheduler::SchedulerCfg;
use crate::sources::newsapi::DEFAULT_BASE_URL;
use crate::worker::WorkerCfg;

pub const ENV_CONFIG_PATH: &str = "NOTIFIER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/notifier.toml";
const ENV_API_KEY: &str = "NEWSAPI_API_KEY";

const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
const MAX_HOURS: i64 = 366 * 24;
const MAX_TIMEOUT_SECS: u64 = 3_600;
const MAX_WAIT_MS: u64 = 600_000;

fn default_interval_minutes() -> u64 {
    5
}
fn default_lookback_hours() -> i64 {
    crate::clock::DEFAULT_LOOKBACK_HOURS
}
fn default_call_timeout_secs() -> u64 {
    5
}
fn default_partitions() -> usize {
    8
}
fn default_topic() -> String {
    "notifications".to_string()
}
fn default_group() -> String {
    "notification-workers".to_string()
}
fn default_dead_letter() -> String {
    "notifications.parked".to_string()
}
fn default_instances() -> usize {
    2
}
fn default_batch_size() -> usize {
    100
}
fn default_poll_wait_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_delivery_timeout_secs() -> u64 {
    10
}
fn default_retention_hours() -> i64 {
    24
}
fn default_dedup_capacity() -> usize {
    100_000
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_true() -> bool {
    true
}
fn default_bind() -> String {
    "127.0.0.1:9100".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_interval_minutes")]
    pub check_interval_minutes: u64,
    /// Lookback for keywords that were never scanned.
    #[serde(default = "default_lookback_hours")]
    pub default_lookback_hours: i64,
    /// Bound for every collaborator call (directory, source, sink, enqueue).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// SQLite file holding the channel. Absent: the channel lives in memory only.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_group")]
    pub consumer_group: String,
    /// Empty disables parking; unprocessable records are then dropped.
    #[serde(default = "default_dead_letter")]
    pub dead_letter_topic: String,
    #[serde(default)]
    pub start_offset: StartOffset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub dedup_retention_hours: i64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Absent: notifications are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySection {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// "ENV" means: read from NEWSAPI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkSection {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// Keep scan marks and delivered event ids across restarts.
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSection {
    /// Empty disables the /health + /metrics listener.
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub worker: WorkerSection,
    pub directory: DirectorySection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub admin: AdminSection,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_interval_minutes(),
            default_lookback_hours: default_lookback_hours(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            database: None,
            partitions: default_partitions(),
            topic: default_topic(),
            consumer_group: default_group(),
            dead_letter_topic: default_dead_letter(),
            start_offset: StartOffset::default(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            instances: default_instances(),
            batch_size: default_batch_size(),
            poll_wait_ms: default_poll_wait_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
            dedup_retention_hours: default_retention_hours(),
            dedup_capacity: default_dedup_capacity(),
            webhook_url: None,
        }
    }
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: default_api_key(),
        }
    }
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            persist: true,
        }
    }
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl NotifierConfig {
    /// Parse, resolve secrets and validate.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: NotifierConfig = toml::from_str(s).context("parsing notifier config")?;
        cfg.resolve_secrets()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading notifier config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Load config using env var + fallback:
    /// 1) $NOTIFIER_CONFIG_PATH
    /// 2) config/notifier.toml
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        Err(anyhow!(
            "no config: set {ENV_CONFIG_PATH} or create {DEFAULT_CONFIG_PATH}"
        ))
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        if self.source.api_key.trim().eq_ignore_ascii_case("env") {
            self.source.api_key = std::env::var(ENV_API_KEY)
                .map_err(|_| anyhow!("Missing {ENV_API_KEY} env var"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.check_interval_minutes == 0 || s.check_interval_minutes > MAX_INTERVAL_MINUTES {
            bail!("scheduler.check_interval_minutes must be in 1..={MAX_INTERVAL_MINUTES}");
        }
        if !(1..=MAX_HOURS).contains(&s.default_lookback_hours) {
            bail!("scheduler.default_lookback_hours must be in 1..={MAX_HOURS}");
        }
        if s.call_timeout_secs == 0 || s.call_timeout_secs > MAX_TIMEOUT_SECS {
            bail!("scheduler.call_timeout_secs must be in 1..={MAX_TIMEOUT_SECS}");
        }
        if self.channel.partitions == 0 {
            bail!("channel.partitions must be > 0");
        }
        if self.channel.topic.trim().is_empty() {
            bail!("channel.topic must not be empty");
        }
        if self.channel.dead_letter_topic == self.channel.topic {
            bail!("channel.dead_letter_topic must differ from channel.topic");
        }
        if self.worker.instances == 0 {
            bail!("worker.instances must be > 0");
        }
        if self.worker.batch_size == 0 {
            bail!("worker.batch_size must be > 0");
        }
        if self.worker.max_attempts == 0 {
            bail!("worker.max_attempts must be > 0");
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.worker.delivery_timeout_secs) {
            bail!("worker.delivery_timeout_secs must be in 1..={MAX_TIMEOUT_SECS}");
        }
        if self.worker.poll_wait_ms > MAX_WAIT_MS {
            bail!("worker.poll_wait_ms must be <= {MAX_WAIT_MS}");
        }
        if self.worker.retry_backoff_ms > MAX_WAIT_MS {
            bail!("worker.retry_backoff_ms must be <= {MAX_WAIT_MS}");
        }
        if self.worker.dedup_retention_hours > MAX_HOURS {
            bail!("worker.dedup_retention_hours must be <= {MAX_HOURS}");
        }
        if self.directory.url.trim().is_empty() {
            bail!("directory.url must not be empty");
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.call_timeout_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.scheduler.default_lookback_hours)
            .unwrap_or_else(|| chrono::Duration::hours(crate::clock::DEFAULT_LOOKBACK_HOURS))
    }

    pub fn scheduler_cfg(&self) -> SchedulerCfg {
        SchedulerCfg {
            interval: Duration::from_secs(self.scheduler.check_interval_minutes.saturating_mul(60)),
            call_timeout: self.call_timeout(),
        }
    }

    pub fn dead_letter_topic(&self) -> Option<String> {
        let t = self.channel.dead_letter_topic.trim();
        (!t.is_empty()).then(|| t.to_string())
    }

    pub fn clock_path(&self) -> Option<PathBuf> {
        self.state
            .persist
            .then(|| self.state.dir.join("dedup_clock.json"))
    }

    /// Worker settings for group member `member`.
    pub fn worker_cfg(&self, member: usize) -> WorkerCfg {
        WorkerCfg {
            batch_size: self.worker.batch_size,
            poll_wait: Duration::from_millis(self.worker.poll_wait_ms),
            max_attempts: self.worker.max_attempts,
            retry_backoff: Duration::from_millis(self.worker.retry_backoff_ms),
            delivery_timeout: Duration::from_secs(self.worker.delivery_timeout_secs),
            dead_letter_topic: self.dead_letter_topic(),
            dedup_state_path: self
                .state
                .persist
                .then(|| self.state.dir.join(format!("seen_events.{member}.json"))),
        }
    }

    pub fn dedup_retention(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.worker.dedup_retention_hours.max(1))
            .unwrap_or_else(|| chrono::Duration::hours(24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [directory]
        url = "http://127.0.0.1:8081/subscriptions"

        [source]
        api_key = "k"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = NotifierConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.scheduler.check_interval_minutes, 5);
        assert_eq!(cfg.scheduler.default_lookback_hours, 24);
        assert_eq!(cfg.channel.partitions, 8);
        assert_eq!(cfg.channel.start_offset, StartOffset::Earliest);
        assert_eq!(cfg.dead_letter_topic().as_deref(), Some("notifications.parked"));
        assert_eq!(cfg.scheduler_cfg().interval, Duration::from_secs(300));
        assert_eq!(cfg.clock_path(), Some(PathBuf::from("state/dedup_clock.json")));
        assert_eq!(
            cfg.worker_cfg(1).dedup_state_path,
            Some(PathBuf::from("state/seen_events.1.json"))
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let s = format!("{MINIMAL}\n[scheduler]\ncheck_interval_minutes = 0\n");
        let err = NotifierConfig::from_toml_str(&s).unwrap_err();
        assert!(format!("{err:#}").contains("check_interval_minutes"));
    }

    #[test]
    fn empty_dead_letter_disables_parking() {
        let s = format!("{MINIMAL}\n[channel]\ndead_letter_topic = \"\"\nstart_offset = \"latest\"\n");
        let cfg = NotifierConfig::from_toml_str(&s).unwrap();
        assert_eq!(cfg.dead_letter_topic(), None);
        assert_eq!(cfg.channel.start_offset, StartOffset::Latest);
    }

    #[test]
    fn oversized_durations_fail_validation() {
        for (section, field, value) in [
            ("scheduler", "default_lookback_hours", i64::MAX.to_string()),
            ("scheduler", "default_lookback_hours", "-3".to_string()),
            ("scheduler", "check_interval_minutes", i64::MAX.to_string()),
            ("scheduler", "call_timeout_secs", "86400".to_string()),
            ("worker", "poll_wait_ms", i64::MAX.to_string()),
            ("worker", "dedup_retention_hours", i64::MAX.to_string()),
        ] {
            let s = format!("{MINIMAL}\n[{section}]\n{field} = {value}\n");
            let err = NotifierConfig::from_toml_str(&s).unwrap_err();
            assert!(format!("{err:#}").contains(field), "{section}.{field} = {value}");
        }
    }

    #[test]
    fn largest_accepted_values_do_not_overflow() {
        let s = format!(
            "{MINIMAL}\n[scheduler]\ncheck_interval_minutes = {MAX_INTERVAL_MINUTES}\ndefault_lookback_hours = {MAX_HOURS}\n"
        );
        let cfg = NotifierConfig::from_toml_str(&s).unwrap();
        assert_eq!(cfg.lookback(), chrono::Duration::hours(MAX_HOURS));
        assert_eq!(cfg.scheduler_cfg().interval, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(NotifierConfig::from_toml_str("[source]\napi_key = \"k\"\n").is_err());
    }
}
