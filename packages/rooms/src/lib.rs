// ABOUTME: Room Store crate: rooms, participants and snapshot persistence
// ABOUTME: Join-key lifecycle, participant counting and snapshot retention

pub mod storage;
pub mod types;

pub use storage::{RoomStorage, StorageError, SNAPSHOT_RETENTION};
pub use types::{
    color_for, CursorPosition, Participant, Room, Snapshot, SnapshotKind, COLOR_PALETTE,
};
