// ABOUTME: JSON frame vocabulary for the realtime endpoint
// ABOUTME: Frames are {event, data}; binary payloads travel as byte arrays

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use codehive_rooms::CursorPosition;
use codehive_sync::PresenceRecord;

/// Inbound events accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userName", default)]
        user_name: Option<String>,
        #[serde(rename = "userColor", default)]
        user_color: Option<String>,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    GetDocument {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    CrdtSyncRequest {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    CrdtSyncStep1 {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "stateVector", default)]
        state_vector: Option<Vec<u8>>,
    },
    CrdtUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
        #[serde(default)]
        origin: Option<String>,
    },
    CursorUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        cursor: CursorPosition,
    },
    PresenceUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        presence: JsonValue,
    },
    Ping,
}

/// Error codes carried by `crdt-error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrdtErrorCode {
    SyncStep1Error,
    SyncRequestError,
    InvalidUpdate,
    UpdateError,
    ConflictResolutionFailed,
    ConflictResolutionError,
}

/// Outbound events emitted by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "socketId")]
        socket_id: String,
        presence: Vec<PresenceRecord>,
    },
    UserJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        color: String,
    },
    UserLeft {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    DocumentContent {
        #[serde(rename = "roomId")]
        room_id: String,
        content: String,
    },
    CrdtSyncResponse {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "stateVector")]
        state_vector: Vec<u8>,
        update: Vec<u8>,
    },
    CrdtSyncStep2 {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
    },
    CrdtUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    CursorUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        cursor: CursorPosition,
    },
    PresenceUpdate {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        presence: JsonValue,
    },
    Pong,
    Error {
        message: String,
    },
    ServerError {
        message: String,
    },
    CrdtError {
        message: String,
        code: CrdtErrorCode,
    },
    CrdtWarning {
        warnings: Vec<String>,
    },
    CrdtConflictResolved {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "resolvedState")]
        resolved_state: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_parse_by_event_name() {
        let frame = r#"{"event":"join-room","data":{"roomId":"r1","userId":"alice"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert!(matches!(
            event,
            ClientEvent::JoinRoom { room_id, user_id, .. }
                if room_id == "r1" && user_id == "alice"
        ));

        let frame = r#"{"event":"ping"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientEvent>(frame).unwrap(),
            ClientEvent::Ping
        ));

        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"nope"}"#).is_err());
    }

    #[test]
    fn binary_payloads_travel_as_byte_arrays() {
        let frame = r#"{"event":"crdt-update","data":{"roomId":"r1","update":[1,2,255]}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        match event {
            ClientEvent::CrdtUpdate { update, origin, .. } => {
                assert_eq!(update, vec![1, 2, 255]);
                assert!(origin.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let out = ServerEvent::CrdtSyncStep2 {
            room_id: "r1".into(),
            update: vec![0, 7, 255],
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["event"], "crdt-sync-step2");
        assert_eq!(json["data"]["update"], serde_json::json!([0, 7, 255]));
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let event = ServerEvent::CrdtError {
            message: "bad".into(),
            code: CrdtErrorCode::SyncStep1Error,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["code"], "SYNC_STEP1_ERROR");
    }

    #[test]
    fn sync_step1_accepts_missing_vector() {
        let frame = r#"{"event":"crdt-sync-step1","data":{"roomId":"r1"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert!(matches!(
            event,
            ClientEvent::CrdtSyncStep1 { state_vector: None, .. }
        ));
    }
}
