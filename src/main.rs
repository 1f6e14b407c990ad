//! TrackTags server entry point.
//!
//! Startup order matters: stores first, then the application actor, then
//! the tick schedulers and background workers, and finally the HTTP
//! listener. Shutdown runs one best-effort flush pass before dropping.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracktags::actors::application::ApplicationActor;
use tracktags::api;
use tracktags::billing::{reconciliation, webhook};
use tracktags::flush;
use tracktags::models::Config;
use tracktags::queue;
use tracktags::state::AppState;
use tracktags::store::SqliteRowStore;
use tracktags::sweeper;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        port = config.port,
        db = %config.database_path,
        mock_mode = config.mock_mode,
        "🚀 TrackTags starting"
    );

    let row_store = Arc::new(
        SqliteRowStore::new(&config.database_path).context("failed to open row store")?,
    );
    let bind = format!("{}:{}", config.bind_addr, config.port);
    let provisioning_workers = config.provisioning_workers;
    let state = Arc::new(AppState::new(config, row_store)?);

    // Root actor owns the auth cache and the business tree.
    let app = ApplicationActor::spawn(state.clone())
        .map_err(|e| anyhow::anyhow!("failed to start application actor: {e}"))?;

    // Tick schedulers and the flush pipeline.
    state.tick_bus.start();
    flush::spawn_flush_workers(state.clone());

    // Background workers.
    reconciliation::spawn_scheduler(state.clone());
    sweeper::spawn(state.clone());
    queue::spawn_workers(state.clone(), provisioning_workers);
    webhook::spawn_event_retry_worker(state.clone());

    let router = api::router(state.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "✅ listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // Best-effort final flush: stage every subscribed tick once and give
    // the drainers a moment to commit.
    if let Err(e) = app.shutdown().await {
        warn!(error = %e, "final flush pass failed");
    }
    tokio::time::sleep(std::time::Duration::from_millis(
        state.config.tick_settle_ms * 2,
    ))
    .await;
    info!("TrackTags stopped");
    Ok(())
}
