mod config;
mod error;
mod registry;
mod registry_manager;
mod relay;
mod upstream;
mod api;

use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::registry::db::RegistryDb;
use crate::registry_manager::RegistryHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("log_relayd=info"))
        )
        .init();

    tracing::info!("Starting log-relayd");

    // Load config; an explicit path must exist, the default one may not
    let config_path = std::env::args().nth(1);
    let config = Config::resolve(config_path.as_deref())
        .with_context(|| format!(
            "Failed to load config from {}",
            config_path.as_deref().unwrap_or(config::DEFAULT_CONFIG_PATH)
        ))?;

    tracing::info!("Public URL is {}", config.server.base_url());

    // Open SQLite database
    let db = RegistryDb::open(&config.registry.db_path)?;
    tracing::info!("Opened registry at {:?}", config.registry.db_path);

    // Start registry thread
    let registry = RegistryHandle::spawn(db, &config.registry);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Build shared state and reconcile streams left by a previous run
    let app_state = api::routes::AppState::new(&config, registry.clone(), cancel.clone())
        .context("Failed to build application state")?;

    match app_state.streams.restore(config.streams.on_restart).await {
        Ok(count) if count > 0 => {
            tracing::info!("Reconciled {} streams ({:?})", count, config.streams.on_restart);
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to reconcile persisted streams: {}", e),
    }

    // Spawn registry maintenance task
    let reaper_cancel = cancel.clone();
    let reaper_config = config.registry.clone();
    let reaper_registry = registry.clone();
    let reaper_handle = tokio::spawn(async move {
        if let Err(e) = registry_manager::run(reaper_registry, reaper_config, reaper_cancel).await {
            tracing::error!("Registry maintenance error: {}", e);
        }
    });

    // Spawn stream maintenance task
    let sweeper_cancel = cancel.clone();
    let sweeper_config = config.streams.clone();
    let sweeper_streams = app_state.streams.clone();
    let sweeper_broadcaster = app_state.broadcaster.clone();
    let sweeper_handle = tokio::spawn(async move {
        if let Err(e) = upstream::streams::run(
            sweeper_streams,
            sweeper_broadcaster,
            sweeper_config,
            sweeper_cancel,
        )
        .await
        {
            tracing::error!("Stream maintenance error: {}", e);
        }
    });

    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;

    tracing::info!("Listening on {}", config.server.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(reaper_handle, sweeper_handle, server_handle);

    // Active streams stay persisted for the next start
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
