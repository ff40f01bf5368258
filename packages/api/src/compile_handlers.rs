// ABOUTME: HTTP handlers for job submission, status polling and cancellation
// ABOUTME: Execution failures are job states, never HTTP failures

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use codehive_jobs::JobOptionsPatch;

use crate::response::{ApiError, Result};
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub room_id: String,
    pub user_id: String,
    pub code: String,
    #[serde(default)]
    pub options: Option<JobOptionsPatch>,
}

/// POST /compile
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> Result<impl IntoResponse> {
    if Uuid::parse_str(&request.room_id).is_err() {
        return Err(ApiError::Validation("roomId must be a UUID".into()));
    }
    if request.user_id.is_empty() {
        return Err(ApiError::Validation("userId is required".into()));
    }

    let job = state
        .dispatcher
        .queue_job(
            &request.room_id,
            &request.user_id,
            &request.code,
            request.options.unwrap_or_default(),
        )
        .await?;

    info!(job_id = %job.id, "compile job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "jobId": job.id,
            "state": job.state.label(),
        })),
    ))
}

/// GET /compile/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse> {
    let status = state.dispatcher.job_status(&job_id).await?;

    let mut body = serde_json::to_value(&status)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    body["timestamp"] = json!(Utc::now());
    Ok(Json(body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelQuery {
    pub user_id: Option<String>,
}

/// DELETE /compile/{job_id}?userId=...
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse> {
    let user_id = query
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::Validation("userId query parameter is required".into()))?;

    let cancelled = state.dispatcher.cancel_job(&job_id, &user_id).await?;
    if !cancelled {
        return Err(ApiError::Validation(
            "job cannot be cancelled (unknown, finished, or not yours)".into(),
        ));
    }

    info!(job_id, "job cancelled");
    Ok(Json(json!({
        "jobId": job_id,
        "state": "Cancelled",
    })))
}
