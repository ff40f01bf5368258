// ABOUTME: Periodic room maintenance: archive idle rooms, sweep participants
// ABOUTME: Backup snapshot precedes archival; loops log failures and continue

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use codehive_rooms::{RoomStorage, SnapshotKind};

use crate::presence::{PresenceTracker, PRESENCE_TTL_MINUTES};
use crate::session::SyncService;

/// Hours without activity before a room is archived.
pub const ARCHIVE_AFTER_HOURS: i64 = 24;

/// Minutes without a heartbeat before a participant row is swept.
pub const PARTICIPANT_TTL_MINUTES: i64 = 30;

const ARCHIVE_SCAN_INTERVAL: Duration = Duration::from_secs(600);
const PARTICIPANT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct RoomMaintenance {
    rooms: Arc<RoomStorage>,
    sync: Arc<SyncService>,
    presence: Arc<PresenceTracker>,
}

impl RoomMaintenance {
    pub fn new(
        rooms: Arc<RoomStorage>,
        sync: Arc<SyncService>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            rooms,
            sync,
            presence,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let maintenance = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ARCHIVE_SCAN_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = maintenance.archive_idle_rooms().await {
                    error!("room archival scan failed: {e}");
                }
            }
        });

        let maintenance = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PARTICIPANT_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match maintenance.rooms.cleanup_inactive(PARTICIPANT_TTL_MINUTES).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "swept inactive participants"),
                    Err(e) => error!("participant sweep failed: {e}"),
                }
                let stale = maintenance.presence.sweep(PRESENCE_TTL_MINUTES).await;
                if stale > 0 {
                    info!(count = stale, "presence records marked inactive");
                }
            }
        });

        info!("room maintenance started");
    }

    /// Archive rooms idle past the threshold, taking a Backup snapshot and
    /// releasing the in-memory document first. Archived rooms stay readable
    /// but reject joins and updates.
    pub async fn archive_idle_rooms(&self) -> codehive_rooms::storage::Result<u64> {
        let idle = self.rooms.find_inactive_rooms(ARCHIVE_AFTER_HOURS).await?;

        let mut archived = 0u64;
        for room in idle {
            match self.sync.create_snapshot(&room.id, SnapshotKind::Backup).await {
                Ok(_) => {}
                Err(e) => {
                    // Fall back to the stored content so archival still
                    // leaves a restoration point.
                    warn!(room_id = %room.id, "live backup failed before archive: {e}");
                    self.rooms
                        .insert_snapshot(
                            &room.id,
                            &room.code_snapshot,
                            room.crdt_state.as_deref(),
                            SnapshotKind::Backup,
                        )
                        .await?;
                }
            }

            self.sync.cleanup_room(&room.id).await;
            self.presence.remove_room(&room.id).await;
            self.rooms.archive(&room.id).await?;
            info!(room_id = %room.id, "room archived after inactivity");
            archived += 1;
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture() -> (Arc<RoomMaintenance>, Arc<RoomStorage>, Arc<SyncService>, sqlx::SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(codehive_rooms::storage::SCHEMA)
            .execute(&pool)
            .await
            .unwrap();
        let rooms = Arc::new(RoomStorage::new(pool.clone()));
        let sync = Arc::new(SyncService::new(rooms.clone()));
        let presence = Arc::new(PresenceTracker::new());
        let maintenance = Arc::new(RoomMaintenance::new(rooms.clone(), sync.clone(), presence));
        (maintenance, rooms, sync, pool)
    }

    #[tokio::test]
    async fn idle_room_is_backed_up_then_archived() {
        let (maintenance, rooms, sync, pool) = fixture().await;
        let room = rooms.create_room().await.unwrap();
        rooms
            .update_snapshot(&room.id, "last words", None)
            .await
            .unwrap();

        // Not idle yet.
        assert_eq!(maintenance.archive_idle_rooms().await.unwrap(), 0);

        sqlx::query("UPDATE rooms SET last_activity = ?1")
            .bind((Utc::now() - chrono::Duration::hours(25)).to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(maintenance.archive_idle_rooms().await.unwrap(), 1);

        let room_after = rooms.find_room(&room.id).await.unwrap();
        assert!(room_after.is_archived);
        assert!(sync.active_rooms().await.is_empty());

        let backup = rooms.latest_snapshot(&room.id).await.unwrap().unwrap();
        assert_eq!(backup.kind, SnapshotKind::Backup);
        assert_eq!(backup.content, "last words");
    }
}
