// src/scheduler.rs
//! Periodic sweep over all subscribed keywords.
//!
//! Each sweep lists subscriptions, groups them by keyword, scans every keyword
//! once, and fans each new article out to every subscriber of that keyword.
//! A keyword's clock moves to the sweep start only after its scan succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::DedupClock;
use crate::error::{within, PipelineError};
use crate::model::{Article, Subscription, UserId};
use crate::publisher::Publisher;
use crate::scanner::Scanner;
use crate::sources::SubscriptionDirectory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scanning,
    Terminated,
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// Bound for the subscription directory call.
    pub call_timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub keywords: usize,
    pub scanned: usize,
    pub scan_failures: usize,
    pub articles: usize,
    pub published: usize,
    pub publish_failures: usize,
    /// Cancellation stopped the sweep before every keyword was attempted.
    pub interrupted: bool,
}

/// Result of an on-demand check of one keyword.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckReport {
    pub keyword: String,
    pub since: DateTime<Utc>,
    pub articles: Vec<Article>,
    /// New articles per subscribed user; users with none are left out.
    pub per_user: BTreeMap<UserId, usize>,
}

pub struct Scheduler {
    directory: Arc<dyn SubscriptionDirectory>,
    scanner: Scanner,
    publisher: Publisher,
    clock: DedupClock,
    cfg: SchedulerCfg,
    state: watch::Sender<SchedulerState>,
}

/// Group subscriptions by trimmed keyword; each user appears once per keyword.
pub fn group_by_keyword(subs: &[Subscription]) -> BTreeMap<String, BTreeSet<UserId>> {
    let mut groups: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();
    for sub in subs {
        let keyword = sub.keyword.trim();
        if keyword.is_empty() {
            tracing::warn!(
                target: "scheduler",
                subscription = sub.id,
                user_id = sub.user_id,
                "skipping subscription with empty keyword"
            );
            continue;
        }
        groups
            .entry(keyword.to_string())
            .or_default()
            .insert(sub.user_id);
    }
    groups
}

/// Lower bound for an on-demand check. A missing or unparseable RFC 3339
/// time falls back to `now - lookback`.
pub fn check_bound(
    last_check: Option<&str>,
    now: DateTime<Utc>,
    lookback: ChronoDuration,
) -> DateTime<Utc> {
    let raw = last_check.map(str::trim).filter(|s| !s.is_empty());
    match raw.map(DateTime::parse_from_rfc3339) {
        Some(Ok(at)) => at.with_timezone(&Utc),
        Some(Err(e)) => {
            tracing::warn!(
                target: "scheduler",
                value = raw.unwrap_or_default(),
                error = %e,
                "unparseable last check time, using default lookback"
            );
            now - lookback
        }
        None => now - lookback,
    }
}

impl Scheduler {
    pub fn new(
        directory: Arc<dyn SubscriptionDirectory>,
        scanner: Scanner,
        publisher: Publisher,
        clock: DedupClock,
        cfg: SchedulerCfg,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            directory,
            scanner,
            publisher,
            clock,
            cfg,
            state,
        }
    }

    pub fn clock(&self) -> &DedupClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut DedupClock {
        &mut self.clock
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// One full pass over all subscribed keywords.
    /// Errors only when the subscription list itself cannot be fetched.
    pub async fn sweep(&mut self, cancel: &CancellationToken) -> Result<SweepReport, PipelineError> {
        let sweep_start = Utc::now();
        self.state.send_replace(SchedulerState::Scanning);
        counter!("scheduler_sweeps_total").increment(1);
        gauge!("scheduler_last_sweep_ts").set(sweep_start.timestamp() as f64);

        let res = self.sweep_inner(sweep_start, cancel).await;

        self.state.send_replace(SchedulerState::Idle);
        match &res {
            Ok(report) => tracing::info!(
                target: "scheduler",
                keywords = report.keywords,
                scanned = report.scanned,
                failed = report.scan_failures,
                articles = report.articles,
                published = report.published,
                publish_failed = report.publish_failures,
                interrupted = report.interrupted,
                "sweep finished"
            ),
            Err(e) => {
                counter!("scheduler_directory_errors_total").increment(1);
                tracing::warn!(target: "scheduler", error = %e, "sweep skipped");
            }
        }
        res
    }

    async fn sweep_inner(
        &mut self,
        sweep_start: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, PipelineError> {
        let subs = within(
            self.cfg.call_timeout,
            "subscription directory",
            self.directory.list_subscriptions(),
        )
        .await?;
        let groups = group_by_keyword(&subs);

        let mut report = SweepReport {
            keywords: groups.len(),
            ..SweepReport::default()
        };

        for (keyword, users) in &groups {
            if cancel.is_cancelled() {
                report.interrupted = true;
                tracing::info!(target: "scheduler", "cancelled mid-sweep, remaining keywords skipped");
                break;
            }
            counter!("scheduler_keywords_total").increment(1);

            let since = self.clock.bound(keyword, sweep_start);
            let articles = match self.scanner.scan(keyword, since).await {
                Ok(a) => a,
                Err(e) => {
                    report.scan_failures += 1;
                    counter!("scheduler_scan_errors_total").increment(1);
                    tracing::warn!(
                        target: "scheduler",
                        error = %e,
                        keyword = %keyword,
                        since = %since.to_rfc3339(),
                        "scan failed, keeping previous bound"
                    );
                    continue;
                }
            };
            report.scanned += 1;
            report.articles += articles.len();

            for article in &articles {
                for &user_id in users {
                    match self.publisher.publish(user_id, keyword, article).await {
                        Ok(env) => {
                            report.published += 1;
                            tracing::info!(
                                target: "scheduler",
                                keyword = %keyword,
                                user_id,
                                event_id = %env.event_id,
                                title = %article.title,
                                "notification published"
                            );
                        }
                        Err(e) => {
                            report.publish_failures += 1;
                            tracing::warn!(
                                target: "scheduler",
                                error = %e,
                                keyword = %keyword,
                                user_id,
                                title = %article.title,
                                "publish failed"
                            );
                        }
                    }
                }
            }

            self.clock.advance(keyword, sweep_start).await;
        }

        Ok(report)
    }

    /// Check one keyword on demand. Finds what its subscribers would be
    /// notified of since `last_check` without publishing anything or moving
    /// the keyword's mark.
    pub async fn check_keyword(
        &self,
        keyword: &str,
        last_check: Option<&str>,
    ) -> Result<CheckReport, PipelineError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(PipelineError::InvalidRequest("keyword is required".into()));
        }
        counter!("scheduler_checks_total").increment(1);
        let since = check_bound(last_check, Utc::now(), self.clock.lookback());

        let subs = within(
            self.cfg.call_timeout,
            "subscription directory",
            self.directory.list_subscriptions(),
        )
        .await?;
        let users = group_by_keyword(&subs)
            .remove(keyword)
            .unwrap_or_default();

        let articles = if users.is_empty() {
            Vec::new()
        } else {
            self.scanner.scan(keyword, since).await?
        };
        let per_user: BTreeMap<UserId, usize> = if articles.is_empty() {
            BTreeMap::new()
        } else {
            users.iter().map(|&u| (u, articles.len())).collect()
        };

        tracing::info!(
            target: "scheduler",
            keyword,
            since = %since.to_rfc3339(),
            subscribers = users.len(),
            articles = articles.len(),
            "keyword checked"
        );
        Ok(CheckReport {
            keyword: keyword.to_string(),
            since,
            articles,
            per_user,
        })
    }

    /// Sweep immediately, then once per interval, until `cancel` fires.
    /// A slow sweep delays the next tick instead of overlapping it.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            target: "scheduler",
            interval_secs = self.cfg.interval.as_secs(),
            "scheduler started"
        );
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep(&cancel).await;
                }
            }
        }

        self.state.send_replace(SchedulerState::Terminated);
        tracing::info!(target: "scheduler", "scheduler stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> SchedulerHandle {
        let state = self.state();
        let join = tokio::spawn(self.run(cancel.clone()));
        SchedulerHandle {
            cancel,
            state,
            join,
        }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SchedulerState>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Ask the loop to stop and wait until the current keyword is done.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(target: "scheduler", error = ?e, "scheduler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: u64, user_id: u64, keyword: &str) -> Subscription {
        Subscription {
            id,
            user_id,
            keyword: keyword.into(),
        }
    }

    #[test]
    fn check_bound_falls_back_on_bad_input() {
        let now = Utc::now();
        let day = ChronoDuration::hours(24);
        assert_eq!(check_bound(None, now, day), now - day);
        assert_eq!(check_bound(Some("  "), now, day), now - day);
        assert_eq!(check_bound(Some("yesterday"), now, day), now - day);
        assert_eq!(
            check_bound(Some("2024-01-01T02:00:00+02:00"), now, day).to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn grouping_trims_dedups_and_skips_empty() {
        let subs = vec![
            sub(1, 7, "bitcoin"),
            sub(2, 9, " bitcoin "),
            sub(3, 9, "bitcoin"),
            sub(4, 7, "rust"),
            sub(5, 1, "   "),
        ];
        let groups = group_by_keyword(&subs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["bitcoin"].iter().copied().collect::<Vec<_>>(), vec![7, 9]);
        assert_eq!(groups["rust"].len(), 1);
    }
}
