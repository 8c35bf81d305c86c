//! sigscan-engine - adaptive concurrent signal scanner
//!
//! Serves scan triggers, the outcome feed and learner control over HTTP,
//! with scanner events streamed over SSE.

use anyhow::{Context, Result};
use clap::Parser;
use sigscan_common::config::load_config;
use sigscan_common::events::EventBus;
use sigscan_common::time::{SharedClock, SystemClock};
use sigscan_engine::fetch::FetchRouter;
use sigscan_engine::{AppState, ScannerService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sigscan-engine", version, about = "Adaptive concurrent signal scanner")]
struct Args {
    /// Configuration file (overrides SIGSCAN_CONFIG and the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sigscan-engine");
    info!("Version: {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = sigscan_common::db::init_database(&db_path).await?;

    let events = EventBus::new(config.service.event_capacity);
    let clock: SharedClock = Arc::new(SystemClock);
    let router = Arc::new(FetchRouter::http_from_config(&config, events.clone())?);

    let bind = config.service.bind.clone();
    let service = ScannerService::build(config, router, Some(pool), clock, events)
        .await
        .context("Failed to start scanner service")?;

    let cancel = CancellationToken::new();
    let background = service.spawn_background(cancel.clone());

    let app = sigscan_engine::build_router(AppState::new(service));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
}
