// ABOUTME: API error taxonomy and HTTP status mapping for the control surface
// ABOUTME: Internal faults are logged with context and never leak details

use axum::{
    http::{header::HeaderName, StatusCode},
    response::{IntoResponse, Json as ResponseJson, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use codehive_jobs::{DispatchError, QueueError};
use codehive_sync::SyncError;

/// Error envelope returned for every non-2xx response.
#[derive(Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

pub static X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Room is archived")]
    Archived,
    #[error("Rate limit exceeded")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_secs: u64,
    },
    #[error("Queue is full")]
    QueueFull,
    #[error("Internal server error")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, ResponseJson(ErrorBody::new(message))).into_response()
            }
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ResponseJson(ErrorBody::new(format!("Not found: {what}"))),
            )
                .into_response(),
            ApiError::Archived => (
                StatusCode::GONE,
                ResponseJson(ErrorBody::new("Room is archived")),
            )
                .into_response(),
            ApiError::RateLimited {
                limit,
                remaining,
                reset_secs,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    ResponseJson(ErrorBody::new("Rate limit exceeded")),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(X_RATE_LIMIT_LIMIT.clone(), limit.into());
                headers.insert(X_RATE_LIMIT_REMAINING.clone(), remaining.into());
                headers.insert(X_RATE_LIMIT_RESET.clone(), reset_secs.into());
                response
            }
            ApiError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                ResponseJson(ErrorBody::new("Execution queue is full, retry later")),
            )
                .into_response(),
            ApiError::Internal(context) => {
                error!("internal error: {context}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ResponseJson(ErrorBody::new("Internal server error")),
                )
                    .into_response()
            }
        }
    }
}

impl From<codehive_rooms::StorageError> for ApiError {
    fn from(e: codehive_rooms::StorageError) -> Self {
        use codehive_rooms::StorageError;
        match e {
            StorageError::RoomNotFound(id) => ApiError::NotFound(id),
            StorageError::ParticipantNotFound { user_id, .. } => ApiError::NotFound(user_id),
            StorageError::Archived(_) => ApiError::Archived,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<codehive_jobs::StorageError> for ApiError {
    fn from(e: codehive_jobs::StorageError) -> Self {
        use codehive_jobs::StorageError;
        match e {
            StorageError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Validation(message) => ApiError::Validation(message),
            DispatchError::NotFound(id) => ApiError::NotFound(id),
            DispatchError::QueueFull => ApiError::QueueFull,
            // Reset is the rolling window; the dispatcher enforces 5/60s.
            DispatchError::RateLimited => ApiError::RateLimited {
                limit: 5,
                remaining: 0,
                reset_secs: 60,
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::RoomNotFound(id) => ApiError::NotFound(id),
            SyncError::Archived(_) => ApiError::Archived,
            SyncError::InvalidUpdate | SyncError::InvalidStateVector => {
                ApiError::Validation(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn statuses_match_the_contract() {
        assert_eq!(
            ApiError::Validation("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::Archived.into_response().status(), StatusCode::GONE);
        assert_eq!(
            ApiError::QueueFull.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Internal("secret detail".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn rate_limited_carries_headers() {
        let response = ApiError::RateLimited {
            limit: 5,
            remaining: 0,
            reset_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-reset"], "42");
    }

    #[tokio::test]
    async fn internal_errors_never_leak_detail() {
        let response = ApiError::Internal("connection string with password".into()).into_response();
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert_eq!(json["success"], false);
    }
}
