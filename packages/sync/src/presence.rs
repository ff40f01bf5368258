// ABOUTME: In-memory per-room presence: colors, cursors, activity timestamps
// ABOUTME: Sweeps mark records inactive without deleting so rejoin keeps colors

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use codehive_rooms::{color_for, CursorPosition};

/// Minutes without a heartbeat before a record is swept inactive.
pub const PRESENCE_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
}

/// Room-scoped presence registry. Purely in-memory; the durable counterpart
/// lives in the participant rows.
#[derive(Default)]
pub struct PresenceTracker {
    rooms: RwLock<HashMap<String, HashMap<String, PresenceRecord>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join (or rejoin), keeping any previously assigned color.
    pub async fn join(&self, room_id: &str, user_id: &str) -> PresenceRecord {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        let record = room
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord {
                user_id: user_id.to_string(),
                color: color_for(user_id).to_string(),
                cursor: None,
                active: true,
                last_seen: Utc::now(),
            });
        record.active = true;
        record.last_seen = Utc::now();
        record.clone()
    }

    /// Mark a user inactive (leave or disconnect). The record survives.
    pub async fn leave(&self, room_id: &str, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            if let Some(record) = room.get_mut(user_id) {
                record.active = false;
                record.last_seen = Utc::now();
            }
        }
    }

    pub async fn update_cursor(&self, room_id: &str, user_id: &str, cursor: CursorPosition) {
        let mut rooms = self.rooms.write().await;
        if let Some(record) = rooms
            .get_mut(room_id)
            .and_then(|room| room.get_mut(user_id))
        {
            record.cursor = Some(cursor);
            record.last_seen = Utc::now();
            record.active = true;
        }
    }

    /// Heartbeat from a presence message.
    pub async fn touch(&self, room_id: &str, user_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(record) = rooms
            .get_mut(room_id)
            .and_then(|room| room.get_mut(user_id))
        {
            record.last_seen = Utc::now();
            record.active = true;
        }
    }

    /// Presence roster for a room, active records first.
    pub async fn room_presence(&self, room_id: &str) -> Vec<PresenceRecord> {
        let rooms = self.rooms.read().await;
        let mut records: Vec<PresenceRecord> = rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| b.active.cmp(&a.active).then(a.user_id.cmp(&b.user_id)));
        records
    }

    /// Mark records inactive after the TTL. Never deletes; a rejoin keeps
    /// the user's color.
    pub async fn sweep(&self, ttl_minutes: i64) -> usize {
        let cutoff = Utc::now() - Duration::minutes(ttl_minutes);
        let mut swept = 0;
        let mut rooms = self.rooms.write().await;
        for room in rooms.values_mut() {
            for record in room.values_mut() {
                if record.active && record.last_seen < cutoff {
                    record.active = false;
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Drop a room's records entirely (room archived or deleted).
    pub async fn remove_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
    }
}
