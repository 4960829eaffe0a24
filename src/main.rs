//! Rigtrack worker
//!
//! Connects the engine to Postgres and runs the background tasks: the
//! conflict monitor, the optional cache reconciler and the transaction queue.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rigtrack::{
    config::AppConfig,
    repository::{run_cache_reconciler, CachedRepository, PgRepository, Repository},
    services::{conflicts::run_conflict_monitor, events::EventFilter, Services},
    AppState,
};

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rigtrack={}", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config);

    tracing::info!("Starting Rigtrack worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    let postgres: Repository = Arc::new(PgRepository::new(pool));
    let repository: Repository = if config.cache.enabled {
        let cache = Arc::new(CachedRepository::new(postgres));
        cache.refresh().await.context("Failed to warm repository cache")?;
        tokio::spawn(run_cache_reconciler(
            cache.clone(),
            Duration::from_secs(config.cache.sync_interval_secs),
        ));
        tracing::info!(
            "Repository cache enabled, reconciling every {}s",
            config.cache.sync_interval_secs
        );
        let cached: Repository = cache;
        cached
    } else {
        postgres
    };

    let services = Services::new(repository, &config.engine)
        .await
        .context("Failed to create services")?;

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };

    let _event_log = state.services.events.on(EventFilter::All, |event| {
        tracing::info!(kind = ?event.kind(), "{:?}", event);
    });

    let monitor = tokio::spawn(run_conflict_monitor(
        state.services.conflicts.clone(),
        state.config.engine.scan_interval(),
        state.config.engine.auto_resolve,
    ));

    tracing::info!(
        "Conflict monitor running every {}s (auto-resolve: {})",
        state.config.engine.scan_interval_secs,
        state.config.engine.auto_resolve
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    monitor.abort();

    Ok(())
}
