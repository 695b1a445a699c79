//! Keyword notifier: host process.
//! Runs the scheduler and the delivery workers until Ctrl-C, with an optional
//! admin listener for `/health` and `/metrics`.
//!
//! Config path: `$NOTIFIER_CONFIG_PATH`, else `config/notifier.toml`.

use anyhow::{Context, Result};
use keyword_notifier::config::NotifierConfig;
use keyword_notifier::metrics::Metrics;
use keyword_notifier::telemetry::init_tracing;
use keyword_notifier::{Collaborators, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (no error if missing)
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = NotifierConfig::load_default().context("loading notifier config")?;
    info!(
        interval_min = cfg.scheduler.check_interval_minutes,
        partitions = cfg.channel.partitions,
        workers = cfg.worker.instances,
        durable_channel = cfg.channel.database.is_some(),
        "config loaded"
    );

    let metrics = Metrics::init()?;
    let admin_stop = CancellationToken::new();
    let admin = if cfg.admin.bind.trim().is_empty() {
        None
    } else {
        let listener = tokio::net::TcpListener::bind(cfg.admin.bind.trim())
            .await
            .with_context(|| format!("binding admin listener on {}", cfg.admin.bind))?;
        info!(addr = %cfg.admin.bind, "admin listener up");
        let router = metrics.router();
        let stop = admin_stop.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    };

    let collab = Collaborators::from_config(&cfg)?;
    let app = Pipeline::build(&cfg, collab).await?.start();
    info!("pipeline running, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    app.shutdown().await;
    admin_stop.cancel();
    if let Some(task) = admin {
        match task.await {
            Ok(Err(e)) => tracing::warn!(error = ?e, "admin listener failed"),
            Err(e) => tracing::warn!(error = ?e, "admin task panicked"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}
