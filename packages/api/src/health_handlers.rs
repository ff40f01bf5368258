// ABOUTME: Liveness probes for the database and the durable queue
// ABOUTME: Unhealthy dependencies answer 503 with a reason

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// GET /health/db
pub async fn health_db(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "timestamp": Utc::now() })),
        ),
        Err(e) => {
            warn!("database health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "timestamp": Utc::now() })),
            )
        }
    }
}

/// GET /health/queue
pub async fn health_queue(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "timestamp": Utc::now() })),
        ),
        Err(e) => {
            warn!("queue health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "timestamp": Utc::now() })),
            )
        }
    }
}
