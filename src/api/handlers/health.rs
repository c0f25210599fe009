use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use futures::StreamExt;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub active_scopes: Vec<String>,
    pub queued_jobs: usize,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    // A missing serve root lists as empty, so only real backend failures show up here.
    let storage_status = match state.storage.enumerate(&state.config.serve_root).next().await {
        Some(Err(e)) => {
            tracing::warn!("Storage health check failed: {}", e);
            "disconnected"
        }
        _ => "connected",
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        storage: format!("{} ({})", storage_status, state.storage.kind()),
        active_scopes: state.coordinator.active_scopes(),
        queued_jobs: state.coordinator.queued_jobs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
