// ABOUTME: WebSocket endpoint: connection lifecycle, heartbeat and dispatch
// ABOUTME: One reader, one writer task and one heartbeat task per connection

pub mod hub;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use codehive_sync::SyncError;

use crate::AppState;
use hub::Outbound;
use protocol::{ClientEvent, CrdtErrorCode, ServerEvent};

/// Heartbeat cadence and the silence budget before a connection is dropped.
pub const PING_INTERVAL: Duration = Duration::from_secs(25);
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let socket_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (mut sink, mut stream) = socket.split();

    info!(socket_id, "websocket connected");

    // Writer: the only task touching the sink, so per-connection sends are
    // serialized.
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let message = match out {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!("unserializable event dropped: {e}");
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let heartbeat = {
        let tx = tx.clone();
        let last_seen = Arc::clone(&last_seen);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let silent = last_seen.lock().unwrap_or_else(|p| p.into_inner()).elapsed();
                if silent > PING_TIMEOUT {
                    let _ = tx.send(Outbound::Close);
                    break;
                }
                if tx.send(Outbound::Ping).is_err() {
                    break;
                }
            }
        })
    };

    let mut connection = Connection {
        state,
        socket_id: socket_id.clone(),
        tx,
        memberships: HashMap::new(),
    };

    while let Some(Ok(message)) = stream.next().await {
        *last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
        match message {
            Message::Text(text) => connection.handle_text(text.as_str()).await,
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; both directions count
            // as liveness.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                connection.send(ServerEvent::Error {
                    message: "binary frames are not accepted; use JSON {event, data}".into(),
                });
            }
        }
    }

    heartbeat.abort();
    connection.disconnect().await;
    writer.abort();
    info!(socket_id, "websocket disconnected");
}

struct Connection {
    state: AppState,
    socket_id: String,
    tx: UnboundedSender<Outbound>,
    /// Rooms this connection has joined: room id -> user id.
    memberships: HashMap<String, String>,
}

impl Connection {
    fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(Outbound::Event(event));
    }

    async fn handle_text(&mut self, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(socket_id = %self.socket_id, "unparseable frame: {e}");
                self.send(ServerEvent::Error {
                    message: format!("unrecognized frame: {e}"),
                });
                return;
            }
        };
        self.dispatch(event).await;
    }

    async fn dispatch(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom {
                room_id, user_id, ..
            } => self.on_join(room_id, user_id).await,
            ClientEvent::LeaveRoom { room_id, user_id } => {
                self.on_leave(&room_id, &user_id).await;
            }
            ClientEvent::GetDocument { room_id } => self.on_get_document(room_id).await,
            ClientEvent::CrdtSyncRequest { room_id } => self.on_sync_request(room_id).await,
            ClientEvent::CrdtSyncStep1 {
                room_id,
                state_vector,
            } => self.on_sync_step1(room_id, state_vector).await,
            ClientEvent::CrdtUpdate {
                room_id,
                update,
                origin,
            } => self.on_crdt_update(room_id, update, origin).await,
            ClientEvent::CursorUpdate { room_id, cursor } => {
                self.on_cursor_update(room_id, cursor).await
            }
            ClientEvent::PresenceUpdate { room_id, presence } => {
                self.on_presence_update(room_id, presence).await
            }
            ClientEvent::Ping => self.send(ServerEvent::Pong),
        }
    }

    async fn on_join(&mut self, room_id: String, user_id: String) {
        if user_id.is_empty() {
            self.send(ServerEvent::Error {
                message: "userId is required".into(),
            });
            return;
        }

        let room = match self.state.rooms.find_room(&room_id).await {
            Ok(room) => room,
            Err(e) => {
                self.send(ServerEvent::Error {
                    message: format!("cannot join room: {e}"),
                });
                return;
            }
        };
        if room.is_archived {
            self.send(ServerEvent::Error {
                message: "room is archived".into(),
            });
            return;
        }

        if let Err(e) = self.state.rooms.mark_active(&room_id, &user_id).await {
            self.send(ServerEvent::ServerError {
                message: format!("join failed: {e}"),
            });
            return;
        }
        let record = self.state.presence.join(&room_id, &user_id).await;
        self.state.hub.join(&room_id, &self.socket_id, self.tx.clone());
        self.memberships.insert(room_id.clone(), user_id.clone());

        let presence = self.state.presence.room_presence(&room_id).await;
        self.send(ServerEvent::RoomJoined {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            socket_id: self.socket_id.clone(),
            presence,
        });
        self.state.hub.broadcast(
            &room_id,
            ServerEvent::UserJoined {
                room_id: room_id.clone(),
                user_id,
                color: record.color,
            },
            Some(&self.socket_id),
        );
    }

    async fn on_leave(&mut self, room_id: &str, user_id: &str) {
        if let Err(e) = self.state.rooms.mark_inactive(room_id, user_id).await {
            warn!(room_id, user_id, "leave bookkeeping failed: {e}");
        }
        self.state.presence.leave(room_id, user_id).await;
        self.state.hub.broadcast(
            room_id,
            ServerEvent::UserLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
            Some(&self.socket_id),
        );
        self.state.hub.leave(room_id, &self.socket_id);
        self.memberships.remove(room_id);
    }

    async fn on_get_document(&mut self, room_id: String) {
        match self.state.sync.document_content(&room_id).await {
            Ok(content) => self.send(ServerEvent::DocumentContent { room_id, content }),
            Err(e) => self.send(ServerEvent::Error {
                message: format!("cannot read document: {e}"),
            }),
        }
    }

    async fn on_sync_request(&mut self, room_id: String) {
        let state_vector = match self.state.sync.encode_state_vector(&room_id).await {
            Ok(sv) => sv,
            Err(e) => {
                self.send(ServerEvent::CrdtError {
                    message: e.to_string(),
                    code: CrdtErrorCode::SyncRequestError,
                });
                return;
            }
        };
        match self.state.sync.encode_diff(&room_id, None).await {
            Ok(update) => self.send(ServerEvent::CrdtSyncResponse {
                room_id,
                state_vector,
                update,
            }),
            Err(e) => self.send(ServerEvent::CrdtError {
                message: e.to_string(),
                code: CrdtErrorCode::SyncRequestError,
            }),
        }
    }

    async fn on_sync_step1(&mut self, room_id: String, state_vector: Option<Vec<u8>>) {
        match self
            .state
            .sync
            .encode_diff(&room_id, state_vector.as_deref())
            .await
        {
            Ok(update) => self.send(ServerEvent::CrdtSyncStep2 { room_id, update }),
            Err(e) => self.send(ServerEvent::CrdtError {
                message: e.to_string(),
                code: CrdtErrorCode::SyncStep1Error,
            }),
        }
    }

    async fn on_crdt_update(&mut self, room_id: String, update: Vec<u8>, origin: Option<String>) {
        let hub = Arc::clone(&self.state.hub);
        let socket_id = self.socket_id.clone();
        let broadcast_room = room_id.clone();
        let broadcast_origin = origin.clone();

        let outcome = self
            .state
            .sync
            .apply_client_update_with(&room_id, &update, move |accepted| {
                // Runs inside the room's apply lane: peers observe updates in
                // apply order.
                hub.broadcast(
                    &broadcast_room,
                    ServerEvent::CrdtUpdate {
                        room_id: broadcast_room.clone(),
                        update: accepted.to_vec(),
                        origin: broadcast_origin,
                    },
                    Some(&socket_id),
                );
            })
            .await;

        match outcome {
            Ok(codehive_sync::ApplyOutcome::Applied { .. }) => {}
            Ok(codehive_sync::ApplyOutcome::ConflictResolved { resolved_state }) => {
                self.send(ServerEvent::CrdtConflictResolved {
                    room_id: room_id.clone(),
                    resolved_state,
                });
                if let Ok(report) = self.state.sync.validate_integrity(&room_id).await {
                    if !report.warnings.is_empty() {
                        self.send(ServerEvent::CrdtWarning {
                            warnings: report.warnings,
                        });
                    }
                }
            }
            Err(SyncError::InvalidUpdate) => self.send(ServerEvent::CrdtError {
                message: "update payload is empty or undecodable".into(),
                code: CrdtErrorCode::InvalidUpdate,
            }),
            Err(SyncError::ConflictResolutionFailed(_)) => self.send(ServerEvent::CrdtError {
                message: "update could not be merged; document restored from snapshot".into(),
                code: CrdtErrorCode::ConflictResolutionFailed,
            }),
            Err(e) => self.send(ServerEvent::CrdtError {
                message: e.to_string(),
                code: CrdtErrorCode::UpdateError,
            }),
        }
    }

    async fn on_cursor_update(&mut self, room_id: String, cursor: codehive_rooms::CursorPosition) {
        let Some(user_id) = self.memberships.get(&room_id).cloned() else {
            self.send(ServerEvent::Error {
                message: "join the room before sending cursor updates".into(),
            });
            return;
        };
        if !cursor.is_valid() {
            self.send(ServerEvent::Error {
                message: "cursor requires lineNumber >= 1 and column >= 0".into(),
            });
            return;
        }

        self.state.presence.update_cursor(&room_id, &user_id, cursor).await;
        if let Err(e) = self.state.rooms.update_cursor(&room_id, &user_id, cursor).await {
            debug!(room_id, user_id, "cursor persist skipped: {e}");
        }
        self.state.hub.broadcast(
            &room_id,
            ServerEvent::CursorUpdate {
                room_id: room_id.clone(),
                user_id,
                cursor,
            },
            Some(&self.socket_id),
        );
    }

    async fn on_presence_update(&mut self, room_id: String, presence: serde_json::Value) {
        let Some(user_id) = self.memberships.get(&room_id).cloned() else {
            self.send(ServerEvent::Error {
                message: "join the room before sending presence updates".into(),
            });
            return;
        };

        self.state.presence.touch(&room_id, &user_id).await;
        if let Err(e) = self.state.rooms.update_presence(&room_id, &user_id).await {
            debug!(room_id, user_id, "presence persist skipped: {e}");
        }
        self.state.hub.broadcast(
            &room_id,
            ServerEvent::PresenceUpdate {
                room_id: room_id.clone(),
                user_id,
                presence,
            },
            Some(&self.socket_id),
        );
    }

    /// Disconnect cleanup: every joined room sees the user go inactive.
    async fn disconnect(&mut self) {
        let memberships: Vec<(String, String)> = self.memberships.drain().collect();
        for (room_id, user_id) in memberships {
            if let Err(e) = self.state.rooms.mark_inactive(&room_id, &user_id).await {
                warn!(room_id, user_id, "disconnect bookkeeping failed: {e}");
            }
            self.state.presence.leave(&room_id, &user_id).await;
            self.state.hub.broadcast(
                &room_id,
                ServerEvent::UserLeft {
                    room_id: room_id.clone(),
                    user_id,
                },
                Some(&self.socket_id),
            );
            self.state.hub.leave(&room_id, &self.socket_id);
        }
    }
}
