//! Main entry point for the file sharing server binary

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use fileshare_core::{
    create_app, resolve_storage_provider, run_server, AppConfig, AppState, CleanupJob,
    CleanupScheduler,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    info!("Configuration loaded successfully");
    info!("Server will bind to: {}", config.bind_address());

    config.create_directories()
        .map_err(|e| anyhow::anyhow!("Failed to create directories: {}", e))?;

    let addr: SocketAddr = config.bind_address().parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    let storage = resolve_storage_provider(&config.storage)
        .map_err(|e| anyhow::anyhow!("Failed to initialize storage provider: {}", e))?;

    info!(
        upload_limit = config.limits.daily_upload_bytes,
        download_limit = config.limits.daily_download_bytes,
        "Daily traffic limits per client"
    );

    let scheduler = CleanupScheduler::new(
        &config.cleanup.cron,
        CleanupJob::new(storage.clone(), config.cleanup.inactivity_minutes),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to schedule cleanup: {}", e))?;
    scheduler.start().await?;

    let state = AppState::new(storage, &config);
    info!("App: {} v{}", state.app_name, state.version);

    let app = create_app(state);
    let served = run_server(
        app,
        addr,
        Duration::from_secs(config.server.shutdown_timeout_seconds),
    )
    .await;

    scheduler.shutdown().await;

    if let Err(e) = served {
        warn!("Server exited with error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            let default_level = if cfg!(debug_assertions) {
                "debug"
            } else {
                "info"
            };

            format!(
                "{}={level},fileshare_core={level},tower_http=debug,tokio_cron_scheduler=warn",
                env!("CARGO_CRATE_NAME").replace('-', "_"),
                level = default_level
            ).into()
        });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let is_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    if is_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.pretty())
            .init();
    }
}
