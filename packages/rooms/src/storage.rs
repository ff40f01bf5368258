// ABOUTME: SQLite store for rooms, participants and room snapshots
// ABOUTME: Join-key generation, atomic participant counting and snapshot pruning

use chrono::{DateTime, Duration, Utc};
use nanoid::nanoid;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::types::{color_for, CursorPosition, Participant, Room, Snapshot, SnapshotKind};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Participant not found in room {room_id}: {user_id}")]
    ParticipantNotFound { room_id: String, user_id: String },
    #[error("Room is archived: {0}")]
    Archived(String),
    #[error("Join key space exhausted after {0} attempts")]
    JoinKeyExhausted(u32),
    #[error("Invalid snapshot kind: {0}")]
    InvalidSnapshotKind(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const JOIN_KEY_LEN: usize = 12;
const JOIN_KEY_RETRIES: u32 = 10;
const JOIN_KEY_ALPHABET: [char; 36] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Most recent snapshots retained per room.
pub const SNAPSHOT_RETENTION: i64 = 20;

/// Table and index definitions, executed by the server at startup and by
/// test fixtures.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    join_key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0,
    participant_count INTEGER NOT NULL DEFAULT 0,
    code_snapshot TEXT NOT NULL DEFAULT '',
    crdt_state BLOB
);
CREATE INDEX IF NOT EXISTS idx_rooms_join_key ON rooms(join_key);
CREATE INDEX IF NOT EXISTS idx_rooms_last_activity ON rooms(last_activity);

CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    cursor_line INTEGER,
    cursor_column INTEGER,
    color TEXT NOT NULL,
    UNIQUE(room_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_participants_room_id ON participants(room_id);
CREATE INDEX IF NOT EXISTS idx_participants_user_id ON participants(user_id);

CREATE TABLE IF NOT EXISTS room_snapshots (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    content TEXT NOT NULL,
    crdt_state BLOB,
    created_at TEXT NOT NULL,
    kind TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_room_snapshots_room_id ON room_snapshots(room_id);
CREATE INDEX IF NOT EXISTS idx_room_snapshots_created_at ON room_snapshots(created_at);
"#;

const ROOM_COLUMNS: &str = "id, join_key, created_at, last_activity, is_archived, \
     participant_count, code_snapshot, crdt_state";

const PARTICIPANT_COLUMNS: &str = "id, room_id, user_id, joined_at, last_seen, is_active, \
     cursor_line, cursor_column, color";

pub struct RoomStorage {
    pool: SqlitePool,
}

impl RoomStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // ROOM OPERATIONS
    // ========================================================================

    /// Create a room with a freshly generated join key. Retries the key on
    /// collision; exhausting the retry budget leaves no partial row behind.
    pub async fn create_room(&self) -> Result<Room> {
        for attempt in 0..JOIN_KEY_RETRIES {
            let room = Room {
                id: Uuid::new_v4().to_string(),
                join_key: nanoid!(JOIN_KEY_LEN, &JOIN_KEY_ALPHABET),
                created_at: Utc::now(),
                last_activity: Utc::now(),
                is_archived: false,
                participant_count: 0,
                code_snapshot: String::new(),
                crdt_state: None,
            };

            let inserted = sqlx::query(
                "INSERT INTO rooms (id, join_key, created_at, last_activity, \
                 is_archived, participant_count, code_snapshot, crdt_state) \
                 VALUES (?1, ?2, ?3, ?4, 0, 0, '', NULL)",
            )
            .bind(&room.id)
            .bind(&room.join_key)
            .bind(room.created_at.to_rfc3339())
            .bind(room.last_activity.to_rfc3339())
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => return Ok(room),
                Err(e) if is_unique_violation(&e) => {
                    warn!(attempt, "join key collision, regenerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::JoinKeyExhausted(JOIN_KEY_RETRIES))
    }

    pub async fn find_room(&self, id: &str) -> Result<Room> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_room(row),
            None => Err(StorageError::RoomNotFound(id.to_string())),
        }
    }

    pub async fn find_room_by_join_key(&self, join_key: &str) -> Result<Room> {
        let row = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE join_key = ?1"
        ))
        .bind(join_key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row_to_room(row),
            None => Err(StorageError::RoomNotFound(join_key.to_string())),
        }
    }

    pub async fn touch_activity(&self, room_id: &str) -> Result<()> {
        sqlx::query("UPDATE rooms SET last_activity = ?2 WHERE id = ?1")
            .bind(room_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the room's code snapshot (and optionally the serialized CRDT
    /// state), refreshing `last_activity`.
    pub async fn update_snapshot(
        &self,
        room_id: &str,
        content: &str,
        crdt_state: Option<&[u8]>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE rooms SET code_snapshot = ?2, \
             crdt_state = COALESCE(?3, crdt_state), last_activity = ?4 \
             WHERE id = ?1 AND is_archived = 0",
        )
        .bind(room_id)
        .bind(content)
        .bind(crdt_state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RoomNotFound(room_id.to_string()));
        }
        Ok(())
    }

    /// Lightweight write used by the debounced state persister.
    pub async fn update_crdt_state(&self, room_id: &str, state: &[u8]) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET crdt_state = ?2, last_activity = ?3 \
             WHERE id = ?1 AND is_archived = 0",
        )
        .bind(room_id)
        .bind(state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_participant_count(&self, room_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET participant_count = participant_count + 1 WHERE id = ?1",
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn decrement_participant_count(&self, room_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE rooms SET participant_count = participant_count - 1 \
             WHERE id = ?1 AND participant_count > 0",
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn archive(&self, room_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE rooms SET is_archived = 1 WHERE id = ?1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RoomNotFound(room_id.to_string()));
        }
        Ok(())
    }

    /// Unarchived rooms whose last activity is older than `hours`.
    pub async fn find_inactive_rooms(&self, hours: i64) -> Result<Vec<Room>> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms \
             WHERE is_archived = 0 AND last_activity < ?1"
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_room).collect()
    }

    // ========================================================================
    // PARTICIPANT OPERATIONS
    // ========================================================================

    /// Upsert a participant as active, assigning a palette color on first
    /// join. Keeps `participant_count` equal to the number of active rows.
    pub async fn mark_active(&self, room_id: &str, user_id: &str) -> Result<Participant> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE room_id = ?1 AND user_id = ?2"
        ))
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let participant = match existing {
            None => {
                let participant = Participant {
                    id: Uuid::new_v4().to_string(),
                    room_id: room_id.to_string(),
                    user_id: user_id.to_string(),
                    joined_at: now,
                    last_seen: now,
                    is_active: true,
                    cursor: None,
                    color: color_for(user_id).to_string(),
                };
                sqlx::query(
                    "INSERT INTO participants (id, room_id, user_id, joined_at, \
                     last_seen, is_active, cursor_line, cursor_column, color) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL, NULL, ?6)",
                )
                .bind(&participant.id)
                .bind(room_id)
                .bind(user_id)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(&participant.color)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE rooms SET participant_count = participant_count + 1 WHERE id = ?1",
                )
                .bind(room_id)
                .execute(&mut *tx)
                .await?;
                participant
            }
            Some(row) => {
                let mut participant = row_to_participant(row)?;
                let was_active = participant.is_active;
                sqlx::query(
                    "UPDATE participants SET is_active = 1, last_seen = ?3 \
                     WHERE room_id = ?1 AND user_id = ?2",
                )
                .bind(room_id)
                .bind(user_id)
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await?;

                if !was_active {
                    sqlx::query(
                        "UPDATE rooms SET participant_count = participant_count + 1 \
                         WHERE id = ?1",
                    )
                    .bind(room_id)
                    .execute(&mut *tx)
                    .await?;
                }
                participant.is_active = true;
                participant.last_seen = now;
                participant
            }
        };

        tx.commit().await?;
        Ok(participant)
    }

    pub async fn mark_inactive(&self, room_id: &str, user_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE participants SET is_active = 0, last_seen = ?3 \
             WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE rooms SET participant_count = participant_count - 1 \
                 WHERE id = ?1 AND participant_count > 0",
            )
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_cursor(
        &self,
        room_id: &str,
        user_id: &str,
        cursor: CursorPosition,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE participants SET cursor_line = ?3, cursor_column = ?4, last_seen = ?5 \
             WHERE room_id = ?1 AND user_id = ?2",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(cursor.line_number)
        .bind(cursor.column)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ParticipantNotFound {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    /// Refresh `last_seen` from a presence message.
    pub async fn update_presence(&self, room_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE participants SET last_seen = ?3 WHERE room_id = ?1 AND user_id = ?2",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_participants(&self, room_id: &str) -> Result<Vec<Participant>> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE room_id = ?1 ORDER BY joined_at ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_participant).collect()
    }

    /// Mark participants inactive after `minutes` without a heartbeat,
    /// adjusting room counts. Returns the number of rows swept.
    pub async fn cleanup_inactive(&self, minutes: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query(
            "SELECT room_id, COUNT(*) AS n FROM participants \
             WHERE is_active = 1 AND last_seen < ?1 GROUP BY room_id",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut swept = 0u64;
        for row in &stale {
            let room_id: String = row.get("room_id");
            let n: i64 = row.get("n");
            sqlx::query(
                "UPDATE rooms SET participant_count = MAX(participant_count - ?2, 0) \
                 WHERE id = ?1",
            )
            .bind(&room_id)
            .bind(n)
            .execute(&mut *tx)
            .await?;
            swept += n as u64;
        }

        sqlx::query(
            "UPDATE participants SET is_active = 0 WHERE is_active = 1 AND last_seen < ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(swept)
    }

    // ========================================================================
    // SNAPSHOT OPERATIONS
    // ========================================================================

    /// Insert a snapshot and prune the room's history beyond the retention
    /// window (20 most recent).
    pub async fn insert_snapshot(
        &self,
        room_id: &str,
        content: &str,
        crdt_state: Option<&[u8]>,
        kind: SnapshotKind,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            content: content.to_string(),
            crdt_state: crdt_state.map(|s| s.to_vec()),
            created_at: Utc::now(),
            kind,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO room_snapshots (id, room_id, content, crdt_state, created_at, kind) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&snapshot.id)
        .bind(room_id)
        .bind(content)
        .bind(crdt_state)
        .bind(snapshot.created_at.to_rfc3339())
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM room_snapshots WHERE room_id = ?1 AND id NOT IN ( \
                 SELECT id FROM room_snapshots WHERE room_id = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT ?2)",
        )
        .bind(room_id)
        .bind(SNAPSHOT_RETENTION)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(snapshot)
    }

    pub async fn latest_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT id, room_id, content, crdt_state, created_at, kind \
             FROM room_snapshots WHERE room_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_snapshot).transpose()
    }

    pub async fn list_snapshots(&self, room_id: &str, limit: i64) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            "SELECT id, room_id, content, crdt_state, created_at, kind \
             FROM room_snapshots WHERE room_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_snapshot).collect()
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn row_to_room(row: sqlx::sqlite::SqliteRow) -> Result<Room> {
    Ok(Room {
        id: row.get("id"),
        join_key: row.get("join_key"),
        created_at: parse_ts(row.get("created_at"))?,
        last_activity: parse_ts(row.get("last_activity"))?,
        is_archived: row.get::<i64, _>("is_archived") != 0,
        participant_count: row.get("participant_count"),
        code_snapshot: row.get("code_snapshot"),
        crdt_state: row.get("crdt_state"),
    })
}

fn row_to_participant(row: sqlx::sqlite::SqliteRow) -> Result<Participant> {
    let line: Option<i64> = row.get("cursor_line");
    let column: Option<i64> = row.get("cursor_column");
    Ok(Participant {
        id: row.get("id"),
        room_id: row.get("room_id"),
        user_id: row.get("user_id"),
        joined_at: parse_ts(row.get("joined_at"))?,
        last_seen: parse_ts(row.get("last_seen"))?,
        is_active: row.get::<i64, _>("is_active") != 0,
        cursor: match (line, column) {
            (Some(line_number), Some(column)) => Some(CursorPosition { line_number, column }),
            _ => None,
        },
        color: row.get("color"),
    })
}

fn row_to_snapshot(row: sqlx::sqlite::SqliteRow) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id"),
        room_id: row.get("room_id"),
        content: row.get("content"),
        crdt_state: row.get("crdt_state"),
        created_at: parse_ts(row.get("created_at"))?,
        kind: SnapshotKind::from_str(&row.get::<String, _>("kind"))?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_storage() -> RoomStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(SCHEMA).execute(&pool).await.unwrap();
        RoomStorage::new(pool)
    }

    #[tokio::test]
    async fn created_room_has_well_formed_join_key() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();

        assert_eq!(room.join_key.len(), 12);
        assert!(room
            .join_key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(room.participant_count, 0);
        assert!(!room.is_archived);

        let by_key = storage.find_room_by_join_key(&room.join_key).await.unwrap();
        assert_eq!(by_key.id, room.id);
    }

    #[tokio::test]
    async fn participant_count_tracks_active_rows() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();

        storage.mark_active(&room.id, "alice").await.unwrap();
        storage.mark_active(&room.id, "bob").await.unwrap();
        // Re-joining while active must not double count.
        storage.mark_active(&room.id, "alice").await.unwrap();
        assert_eq!(storage.find_room(&room.id).await.unwrap().participant_count, 2);

        storage.mark_inactive(&room.id, "alice").await.unwrap();
        assert_eq!(storage.find_room(&room.id).await.unwrap().participant_count, 1);

        // Double leave stays at 1.
        storage.mark_inactive(&room.id, "alice").await.unwrap();
        assert_eq!(storage.find_room(&room.id).await.unwrap().participant_count, 1);

        // Reactivation counts again.
        storage.mark_active(&room.id, "alice").await.unwrap();
        assert_eq!(storage.find_room(&room.id).await.unwrap().participant_count, 2);
    }

    #[tokio::test]
    async fn rejoin_preserves_color() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();

        let first = storage.mark_active(&room.id, "alice").await.unwrap();
        storage.mark_inactive(&room.id, "alice").await.unwrap();
        let second = storage.mark_active(&room.id, "alice").await.unwrap();

        assert_eq!(first.color, second.color);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn cursor_updates_require_membership() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();
        let cursor = CursorPosition { line_number: 3, column: 7 };

        assert!(storage.update_cursor(&room.id, "ghost", cursor).await.is_err());

        storage.mark_active(&room.id, "alice").await.unwrap();
        storage.update_cursor(&room.id, "alice", cursor).await.unwrap();

        let participants = storage.find_participants(&room.id).await.unwrap();
        assert_eq!(participants[0].cursor, Some(cursor));
    }

    #[tokio::test]
    async fn cleanup_marks_stale_participants_inactive() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();
        storage.mark_active(&room.id, "alice").await.unwrap();

        // Fresh participant is not swept.
        assert_eq!(storage.cleanup_inactive(30).await.unwrap(), 0);

        sqlx::query("UPDATE participants SET last_seen = ?1")
            .bind((Utc::now() - Duration::minutes(45)).to_rfc3339())
            .execute(&storage.pool)
            .await
            .unwrap();

        assert_eq!(storage.cleanup_inactive(30).await.unwrap(), 1);
        let room = storage.find_room(&room.id).await.unwrap();
        assert_eq!(room.participant_count, 0);

        // The row survives so the color is stable on rejoin.
        let participants = storage.find_participants(&room.id).await.unwrap();
        assert_eq!(participants.len(), 1);
        assert!(!participants[0].is_active);
    }

    #[tokio::test]
    async fn snapshots_prune_beyond_retention() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();

        for i in 0..25 {
            storage
                .insert_snapshot(&room.id, &format!("v{i}"), None, SnapshotKind::Auto)
                .await
                .unwrap();
        }

        let kept = storage.list_snapshots(&room.id, 100).await.unwrap();
        assert_eq!(kept.len(), SNAPSHOT_RETENTION as usize);
        // Latest content wins.
        assert_eq!(storage.latest_snapshot(&room.id).await.unwrap().unwrap().content, "v24");
    }

    #[tokio::test]
    async fn archive_blocks_snapshot_updates() {
        let storage = test_storage().await;
        let room = storage.create_room().await.unwrap();
        storage.archive(&room.id).await.unwrap();

        assert!(storage.update_snapshot(&room.id, "text", None).await.is_err());
        assert!(storage.find_room(&room.id).await.unwrap().is_archived);
    }

    #[tokio::test]
    async fn inactive_rooms_query_skips_archived() {
        let storage = test_storage().await;
        let stale = storage.create_room().await.unwrap();
        let archived = storage.create_room().await.unwrap();
        storage.archive(&archived.id).await.unwrap();

        let old = (Utc::now() - Duration::hours(30)).to_rfc3339();
        sqlx::query("UPDATE rooms SET last_activity = ?1")
            .bind(&old)
            .execute(&storage.pool)
            .await
            .unwrap();

        let inactive = storage.find_inactive_rooms(24).await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, stale.id);
    }
}
