// ABOUTME: Room, participant and snapshot entities shared across the core
// ABOUTME: Includes the cursor shape and the fixed participant color palette

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Fixed palette of participant colors. Assignment is deterministic per user
/// so a rejoining user keeps their color.
pub const COLOR_PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9",
];

/// FNV-1a over the user id, reduced onto the palette.
pub fn color_for(user_id: &str) -> &'static str {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    COLOR_PALETTE[(hash % COLOR_PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub join_key: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_archived: bool,
    pub participant_count: i64,
    #[serde(rename = "codeContent")]
    pub code_snapshot: String,
    /// Serialized CRDT state; transported as base64 at the HTTP surface.
    #[serde(skip)]
    pub crdt_state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// 1-based line.
    pub line_number: i64,
    /// 0-based column.
    pub column: i64,
}

impl CursorPosition {
    pub fn is_valid(&self) -> bool {
        self.line_number >= 1 && self.column >= 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub cursor: Option<CursorPosition>,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    Auto,
    Manual,
    Backup,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Backup => "backup",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            "backup" => Ok(Self::Backup),
            _ => Err(StorageError::InvalidSnapshotKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub room_id: String,
    pub content: String,
    #[serde(skip)]
    pub crdt_state: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
}
