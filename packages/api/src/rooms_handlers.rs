// ABOUTME: HTTP handlers for room lifecycle, membership and snapshots
// ABOUTME: Join keys are validated here; archived rooms answer 410

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

use codehive_rooms::CursorPosition;

use crate::response::{ApiError, Result};
use crate::AppState;

fn is_valid_join_key(key: &str) -> bool {
    key.len() == 12
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// POST /rooms
pub async fn create_room(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse> {
    state.limits.check_create(addr.ip())?;

    let room = state.rooms.create_room().await?;
    info!(room_id = %room.id, "room created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "roomKey": room.join_key,
            "roomId": room.id,
            "createdAt": room.created_at,
        })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_key: String,
    pub user_id: Option<String>,
}

/// POST /rooms/join
pub async fn join_room(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<JoinRoomRequest>,
) -> Result<impl IntoResponse> {
    state.limits.check_join(addr.ip())?;

    let key = request.room_key.trim().to_ascii_uppercase();
    if !is_valid_join_key(&key) {
        return Err(ApiError::Validation(
            "roomKey must be 12 uppercase alphanumeric characters".into(),
        ));
    }

    let room = state.rooms.find_room_by_join_key(&key).await?;
    if room.is_archived {
        return Err(ApiError::Archived);
    }

    let user_id = match request.user_id.filter(|u| !u.is_empty()) {
        Some(user_id) => user_id,
        None => format!("user-{}", Uuid::new_v4()),
    };
    state.rooms.mark_active(&room.id, &user_id).await?;

    // Re-read for the updated participant count.
    let room = state.rooms.find_room(&room.id).await?;
    let crdt_state = room.crdt_state.as_deref().map(|s| BASE64.encode(s));
    info!(room_id = %room.id, user_id, "user joined room");

    Ok(Json(json!({
        "roomData": room,
        "crdtState": crdt_state,
        "userId": user_id,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomRequest {
    pub room_id: String,
    pub user_id: String,
}

/// POST /rooms/leave
pub async fn leave_room(
    State(state): State<AppState>,
    Json(request): Json<LeaveRoomRequest>,
) -> Result<impl IntoResponse> {
    if request.room_id.is_empty() || request.user_id.is_empty() {
        return Err(ApiError::Validation("roomId and userId are required".into()));
    }

    state
        .rooms
        .mark_inactive(&request.room_id, &request.user_id)
        .await?;
    state.presence.leave(&request.room_id, &request.user_id).await;

    Ok(Json(json!({ "success": true })))
}

/// GET /rooms/{room_id}
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    if room_id.is_empty() {
        return Err(ApiError::Validation("roomId is required".into()));
    }
    let mut room = state.rooms.find_room(&room_id).await?;

    // A live document is ahead of the debounced snapshot write.
    if let Some(content) = state.sync.live_content(&room_id).await {
        room.code_snapshot = content;
    }

    Ok(Json(room))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomRequest {
    pub content: String,
    pub crdt_state: Option<String>,
}

/// PUT /rooms/{room_id}
pub async fn update_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(request): Json<UpdateRoomRequest>,
) -> Result<impl IntoResponse> {
    let crdt_state = match &request.crdt_state {
        Some(encoded) => Some(BASE64.decode(encoded).map_err(|_| {
            ApiError::Validation("crdtState must be valid base64".into())
        })?),
        None => None,
    };

    state
        .rooms
        .update_snapshot(&room_id, &request.content, crdt_state.as_deref())
        .await
        .map_err(|e| match e {
            // The update surface only answers 400/500.
            codehive_rooms::StorageError::RoomNotFound(id) => {
                ApiError::Validation(format!("unknown room: {id}"))
            }
            other => ApiError::from(other),
        })?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub participants: Vec<codehive_rooms::Participant>,
    pub count: i64,
}

/// GET /rooms/{room_id}/participants
pub async fn get_participants(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    if room_id.is_empty() {
        return Err(ApiError::Validation("roomId is required".into()));
    }
    let participants = state.rooms.find_participants(&room_id).await?;
    let count = participants.iter().filter(|p| p.is_active).count() as i64;

    Ok(Json(ParticipantsResponse {
        participants,
        count,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdateRequest {
    pub user_id: String,
    pub cursor_position: CursorPosition,
}

/// PUT /rooms/{room_id}/cursor
pub async fn update_cursor(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(request): Json<CursorUpdateRequest>,
) -> Result<impl IntoResponse> {
    if !request.cursor_position.is_valid() {
        return Err(ApiError::Validation(
            "cursorPosition requires lineNumber >= 1 and column >= 0".into(),
        ));
    }

    state
        .rooms
        .update_cursor(&room_id, &request.user_id, request.cursor_position)
        .await
        .map_err(|e| match e {
            // The cursor surface only answers 400.
            codehive_rooms::StorageError::ParticipantNotFound { user_id, .. } => {
                ApiError::Validation(format!("unknown participant: {user_id}"))
            }
            codehive_rooms::StorageError::RoomNotFound(id) => {
                ApiError::Validation(format!("unknown room: {id}"))
            }
            other => ApiError::from(other),
        })?;

    state
        .presence
        .update_cursor(&room_id, &request.user_id, request.cursor_position)
        .await;

    Ok(Json(json!({ "success": true })))
}
