// ABOUTME: Real-time document synchronization: CRDT sessions and presence
// ABOUTME: Per-room apply lanes serialize all document mutation

pub mod maintenance;
pub mod presence;
pub mod session;

pub use maintenance::{RoomMaintenance, ARCHIVE_AFTER_HOURS, PARTICIPANT_TTL_MINUTES};
pub use presence::{PresenceRecord, PresenceTracker, PRESENCE_TTL_MINUTES};
pub use session::{
    ApplyOutcome, IntegrityReport, RoomSession, SyncError, SyncService,
    SNAPSHOT_INTERVAL, SNAPSHOT_UPDATE_THRESHOLD, STATE_PERSIST_DEBOUNCE,
};
