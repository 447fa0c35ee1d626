//! Liveness endpoint

use axum::{extract::State, response::IntoResponse, Json};

use crate::AppState;

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "app": state.app_name,
        "version": state.version,
        "storage": state.file_service.storage().name(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}
