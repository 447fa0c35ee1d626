//! Route table for the file sharing API

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::{
    handlers::{files, health},
    middleware::quota::{download_limiter, upload_limiter},
    AppState,
};

/// Quota layers are attached per method so that only uploads and downloads
/// are charged; deletes and health checks are free.
pub fn create_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health::handle_health))
        .route(
            "/files",
            post(files::upload_file)
                .layer(from_fn_with_state(state.upload_usage.clone(), upload_limiter)),
        )
        .route(
            "/files/:key",
            get(files::download_file)
                .layer(from_fn_with_state(state.download_usage.clone(), download_limiter))
                .delete(files::delete_file),
        )
}
