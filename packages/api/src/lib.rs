// ABOUTME: Control surface: HTTP routes and the realtime endpoint
// ABOUTME: Stateless adapters; long-lived state lives in stores and services

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use sqlx::SqlitePool;

use codehive_jobs::{ExecutionDispatcher, Queue};
use codehive_rooms::RoomStorage;
use codehive_sync::{PresenceTracker, SyncService};

pub mod compile_handlers;
pub mod health_handlers;
pub mod rate_limit;
pub mod response;
pub mod rooms_handlers;
pub mod ws;

pub use rate_limit::AddressRateLimits;
pub use response::ApiError;
pub use ws::hub::RoomHub;

/// Shared state for every handler. Cheap to clone; all fields are handles.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub rooms: Arc<RoomStorage>,
    pub dispatcher: Arc<ExecutionDispatcher>,
    pub queue: Arc<dyn Queue>,
    pub sync: Arc<SyncService>,
    pub presence: Arc<PresenceTracker>,
    pub hub: Arc<RoomHub>,
    pub limits: Arc<AddressRateLimits>,
}

/// Build the public router over the shared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/rooms", post(rooms_handlers::create_room))
        .route("/rooms/join", post(rooms_handlers::join_room))
        .route("/rooms/leave", post(rooms_handlers::leave_room))
        .route(
            "/rooms/{room_id}",
            get(rooms_handlers::get_room).put(rooms_handlers::update_room),
        )
        .route(
            "/rooms/{room_id}/participants",
            get(rooms_handlers::get_participants),
        )
        .route("/rooms/{room_id}/cursor", put(rooms_handlers::update_cursor))
        .route("/compile", post(compile_handlers::submit_job))
        .route(
            "/compile/{job_id}",
            get(compile_handlers::job_status).delete(compile_handlers::cancel_job),
        )
        .route("/health/db", get(health_handlers::health_db))
        .route("/health/queue", get(health_handlers::health_queue))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use codehive_jobs::test_support::InMemoryQueue;
    use codehive_jobs::{DispatcherConfig, JobStorage};
    use sqlx::sqlite::SqlitePoolOptions;

    pub async fn test_state() -> AppState {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(codehive_rooms::storage::SCHEMA)
            .execute(&db)
            .await
            .unwrap();
        sqlx::raw_sql(codehive_jobs::JOBS_SCHEMA)
            .execute(&db)
            .await
            .unwrap();

        let rooms = Arc::new(RoomStorage::new(db.clone()));
        let jobs = Arc::new(JobStorage::new(db.clone()));
        let queue: Arc<InMemoryQueue> = Arc::new(InMemoryQueue::default());
        let dispatcher = Arc::new(ExecutionDispatcher::new(
            jobs,
            queue.clone(),
            DispatcherConfig::default(),
        ));
        let sync = Arc::new(SyncService::new(rooms.clone()));

        AppState {
            db,
            rooms,
            dispatcher,
            queue,
            sync,
            presence: Arc::new(PresenceTracker::new()),
            hub: Arc::new(RoomHub::new()),
            limits: Arc::new(AddressRateLimits::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_state;
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(addr));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_join_and_read_room() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request("POST", "/rooms", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        let room_key = created["roomKey"].as_str().unwrap().to_string();
        let room_id = created["roomId"].as_str().unwrap().to_string();
        assert_eq!(room_key.len(), 12);
        assert!(room_key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/rooms/join",
                Some(serde_json::json!({ "roomKey": room_key, "userId": "alice" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let joined = json_body(response).await;
        assert_eq!(joined["userId"], "alice");
        assert!(joined["roomData"]["participantCount"].as_i64().unwrap() >= 1);
        assert!(joined["crdtState"].is_null());

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/rooms/{room_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = json_body(response).await;
        assert_eq!(fetched["id"], room_id.as_str());

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/rooms/{room_id}/participants"),
                None,
            ))
            .await
            .unwrap();
        let participants = json_body(response).await;
        assert_eq!(participants["count"], 1);
    }

    #[tokio::test]
    async fn join_with_unknown_key_is_404_and_bad_key_is_400() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/rooms/join",
                Some(serde_json::json!({ "roomKey": "ABCDEFGH0000" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(
                "POST",
                "/rooms/join",
                Some(serde_json::json!({ "roomKey": "short" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn archived_room_join_is_410() {
        let state = test_state().await;
        let room = state.rooms.create_room().await.unwrap();
        state.rooms.archive(&room.id).await.unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(request(
                "POST",
                "/rooms/join",
                Some(serde_json::json!({ "roomKey": room.join_key })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn compile_accepts_then_reports_queued_status() {
        let state = test_state().await;
        let room = state.rooms.create_room().await.unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/compile",
                Some(serde_json::json!({
                    "roomId": room.id,
                    "userId": "alice",
                    "code": "#include<iostream>\nint main(){std::cout<<\"Hello\";return 0;}"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json_body(response).await;
        assert_eq!(accepted["state"], "Queued");
        let job_id = accepted["jobId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/compile/{job_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json_body(response).await;
        assert_eq!(status["state"], "Queued");
        assert_eq!(status["queuePosition"], 1);
        assert!(status["timestamp"].is_string());

        let response = app
            .oneshot(request("GET", "/compile/does-not-exist", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compile_validates_room_id_and_code_size() {
        let state = test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/compile",
                Some(serde_json::json!({
                    "roomId": "not-a-uuid",
                    "userId": "alice",
                    "code": "int main() {}"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request(
                "POST",
                "/compile",
                Some(serde_json::json!({
                    "roomId": uuid::Uuid::new_v4().to_string(),
                    "userId": "alice",
                    "code": "a".repeat(101 * 1024)
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sixth_submission_is_429() {
        let state = test_state().await;
        let room = state.rooms.create_room().await.unwrap();
        let app = create_router(state);

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request(
                    "POST",
                    "/compile",
                    Some(serde_json::json!({
                        "roomId": room.id,
                        "userId": "alice",
                        "code": "int main() {}"
                    })),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let response = app
            .oneshot(request(
                "POST",
                "/compile",
                Some(serde_json::json!({
                    "roomId": room.id,
                    "userId": "alice",
                    "code": "int main() {}"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn cancel_queued_job_then_cancel_again_is_400() {
        let state = test_state().await;
        let room = state.rooms.create_room().await.unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/compile",
                Some(serde_json::json!({
                    "roomId": room.id,
                    "userId": "alice",
                    "code": "int main() {}"
                })),
            ))
            .await
            .unwrap();
        let job_id = json_body(response).await["jobId"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(request(
                "DELETE",
                &format!("/compile/{job_id}?userId=alice"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cancelled = json_body(response).await;
        assert_eq!(cancelled["state"], "Cancelled");

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/compile/{job_id}"), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["state"], "Cancelled");

        let response = app
            .oneshot(request(
                "DELETE",
                &format!("/compile/{job_id}?userId=alice"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn room_update_and_cursor_endpoints() {
        let state = test_state().await;
        let room = state.rooms.create_room().await.unwrap();
        state.rooms.mark_active(&room.id, "alice").await.unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/rooms/{}", room.id),
                Some(serde_json::json!({ "content": "int main() {}" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/rooms/{}", room.id), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["codeContent"], "int main() {}");

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/rooms/{}/cursor", room.id),
                Some(serde_json::json!({
                    "userId": "alice",
                    "cursorPosition": { "lineNumber": 2, "column": 4 }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Line 0 violates the 1-based invariant.
        let response = app
            .oneshot(request(
                "PUT",
                &format!("/rooms/{}/cursor", room.id),
                Some(serde_json::json!({
                    "userId": "alice",
                    "cursorPosition": { "lineNumber": 0, "column": 0 }
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_db_reports_healthy() {
        let state = test_state().await;
        let app = create_router(state);
        let response = app
            .oneshot(request("GET", "/health/db", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
