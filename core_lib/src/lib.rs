//! Core library for the file sharing server: storage backends, quota
//! tracking, the cleanup job and the HTTP routes that tie them together.

pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod services;
pub mod storage;
pub mod usage;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use handlers::routes::create_routes;
pub use jobs::{CleanupJob, CleanupScheduler};
pub use services::{FileService, KeyPair};
pub use storage::{resolve_storage_provider, CloudStorage, LocalStorage, StorageProvider};
pub use usage::UsageTracker;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{extract::DefaultBodyLimit, Router};
use tokio::{signal, sync::oneshot};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub app_name: String,
    pub version: String,
    pub file_service: FileService,
    pub upload_usage: UsageTracker,
    pub download_usage: UsageTracker,
    pub staging_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(storage: Arc<dyn StorageProvider>, config: &AppConfig) -> Self {
        Self {
            app_name: "File Sharing Server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            file_service: FileService::new(storage),
            upload_usage: UsageTracker::uploads(config.limits.daily_upload_bytes),
            download_usage: UsageTracker::downloads(config.limits.daily_download_bytes),
            staging_dir: config.storage.staging_dir.clone(),
            max_upload_bytes: config.server.max_upload_bytes,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(create_routes(&state))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(middleware::logging::logging_layer())
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM. In-flight requests get `shutdown_timeout`
/// to finish before the server is dropped.
pub async fn run_server(app: Router, addr: SocketAddr, shutdown_timeout: Duration) -> Result<()> {
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = app.into_make_service_with_connect_info::<SocketAddr>();

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });
    let mut server = tokio::spawn(async move { server.await });

    let deadline = async move {
        if signalled_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(shutdown_timeout).await;
    };

    tokio::select! {
        joined = &mut server => {
            joined.map_err(|e| AppError::Other(e.into()))??;
            info!("Server stopped");
        }
        _ = deadline => {
            warn!(
                timeout_seconds = shutdown_timeout.as_secs(),
                "Could not close connections in time, forcefully shutting down"
            );
            server.abort();
        }
    }

    Ok(())
}

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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
