//! Progress engine service (tw-progress) - Main entry point
//!
//! Opens the database, builds the engine and runs the attempt sweeper
//! until shutdown. Engine events are written to the log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tw_common::events::EventBus;
use tw_common::SystemClock;
use tw_progress::cache::MemoryCache;
use tw_progress::config::EngineConfig;
use tw_progress::store::SqliteStore;
use tw_progress::Engine;

/// Command-line arguments for tw-progress
#[derive(Parser, Debug)]
#[command(name = "tw-progress")]
#[command(about = "Progress and activity verification engine for TestWise")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database file, overrides the configuration file
    #[arg(short, long, env = "TW_DATABASE")]
    database: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "tw_progress=info,tw_common=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TestWise progress engine v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = tw_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    config
        .apply_settings(&pool)
        .await
        .context("Failed to apply database settings")?;

    let clock = Arc::new(SystemClock);
    let events = EventBus::new(config.event_capacity());
    let sweep_interval = Duration::from_secs(config.sweeper.interval_seconds);

    let engine = Engine::new(
        config,
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(MemoryCache::new(clock.clone())),
        clock,
        events.clone(),
    )
    .context("Failed to initialize progress engine")?;

    let mut rx = events.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = event.event_type(), "{}", json),
                    Err(e) => warn!("Failed to serialize {} event: {}", event.event_type(), e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, {} events skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sweeper_engine = engine.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            match sweeper_engine.sweep_attempts().await {
                Ok(report) => debug!(?report, "Sweep complete"),
                Err(e) => error!("Attempt sweep failed: {}", e),
            }
        }
    });

    info!("Attempt sweeper running every {:?}", sweep_interval);

    shutdown_signal().await;

    sweeper.abort();
    event_logger.abort();
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
