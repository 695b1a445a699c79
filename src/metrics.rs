use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("scheduler_sweeps_total", "Sweeps started by the scheduler.");
        describe_counter!("scheduler_keywords_total", "Keyword scans attempted.");
        describe_counter!(
            "scheduler_scan_errors_total",
            "Keyword scans that failed; their clock was not advanced."
        );
        describe_counter!(
            "scheduler_directory_errors_total",
            "Sweeps skipped because subscriptions could not be listed."
        );
        describe_counter!(
            "scheduler_checks_total",
            "On-demand single keyword checks."
        );
        describe_gauge!(
            "scheduler_last_sweep_ts",
            "Unix ts when the last sweep started."
        );
        describe_counter!("scanner_articles_total", "New articles found by scans.");
        describe_histogram!("scanner_scan_ms", "Article source call time in milliseconds.");
        describe_histogram!("scanner_parse_ms", "Article source parse time in milliseconds.");
        describe_counter!("sink_errors_total", "Article sink save failures.");
        describe_counter!("publisher_envelopes_total", "Envelopes accepted by the channel.");
        describe_counter!("publisher_errors_total", "Envelopes that failed to enqueue.");
        describe_counter!("worker_delivered_total", "Envelopes delivered.");
        describe_counter!(
            "worker_duplicates_total",
            "Redelivered envelopes skipped by event id."
        );
        describe_counter!("worker_dropped_total", "Undecodable records dropped.");
        describe_counter!(
            "worker_parked_total",
            "Records moved to the dead-letter topic."
        );
        describe_counter!(
            "worker_delivery_errors_total",
            "Failed delivery attempts (each retry counts)."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder for this process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/health` and `/metrics` (Prometheus text format).
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        admin_router().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Liveness only; no recorder needed.
pub fn admin_router() -> Router {
    Router::new().route("/health", get(|| async { "ok" }))
}
