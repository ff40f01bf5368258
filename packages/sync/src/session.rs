// ABOUTME: CRDT Session Manager owning per-room collaborative documents
// ABOUTME: Restoration chain, snapshot policy, conflict recovery, sync encodings

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use codehive_rooms::{RoomStorage, Snapshot, SnapshotKind, StorageError};

/// Auto snapshot after this many applied updates.
pub const SNAPSHOT_UPDATE_THRESHOLD: u32 = 100;

/// Periodic auto snapshot cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Debounce window for persisting the room's latest CRDT state.
pub const STATE_PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// Encoded documents above this size raise an integrity warning.
const STATE_SIZE_WARNING_BYTES: usize = 1024 * 1024;

/// Content-length divergence from the latest snapshot that raises a warning.
const DIVERGENCE_WARNING_CHARS: usize = 10_000;

/// Name of the shared text field carrying the room's code.
const CODE_FIELD: &str = "code";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Room is archived: {0}")]
    Archived(String),
    #[error("Update payload is empty or undecodable")]
    InvalidUpdate,
    #[error("State vector is undecodable")]
    InvalidStateVector,
    #[error("Document integrity check failed: {0:?}")]
    Integrity(Vec<String>),
    #[error("Conflict resolution failed for room {0}")]
    ConflictResolutionFailed(String),
    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RoomNotFound(id) => SyncError::RoomNotFound(id),
            StorageError::Archived(id) => SyncError::Archived(id),
            other => SyncError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Result of applying a client update to the canonical document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Update applied cleanly; broadcast these bytes to the room's peers.
    Applied { update: Vec<u8> },
    /// The update initially failed and was merged through a scratch
    /// document; the sender must be told the resolved full state.
    ConflictResolved { resolved_state: Vec<u8> },
}

/// Integrity verdict for a document.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct SessionState {
    doc: Doc,
    /// Updates applied since the last threshold snapshot.
    update_count: u32,
    last_state_persist: Instant,
    dirty: bool,
}

/// One room's document plus its serialized apply lane.
pub struct RoomSession {
    room_id: String,
    state: Mutex<SessionState>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RoomSession {
    fn new(room_id: &str, doc: Doc) -> Self {
        Self {
            room_id: room_id.to_string(),
            state: Mutex::new(SessionState {
                doc,
                update_count: 0,
                last_state_persist: Instant::now(),
                dirty: false,
            }),
            timer: Mutex::new(None),
        }
    }
}

/// In-memory registry of room documents. All document mutation goes through
/// the per-room lane; cross-room operations are independent.
pub struct SyncService {
    rooms: Arc<RoomStorage>,
    sessions: RwLock<HashMap<String, Arc<RoomSession>>>,
}

impl SyncService {
    pub fn new(rooms: Arc<RoomStorage>) -> Self {
        Self {
            rooms,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the room's live document, constructing and restoring it on
    /// first access. Restoration order: room `crdt_state`, latest snapshot
    /// state, snapshot/room text content, empty.
    pub async fn initialize_document(self: &Arc<Self>, room_id: &str) -> Result<Arc<RoomSession>> {
        if let Some(session) = self.sessions.read().await.get(room_id) {
            return Ok(session.clone());
        }

        let room = self.rooms.find_room(room_id).await?;
        if room.is_archived {
            return Err(SyncError::Archived(room_id.to_string()));
        }

        let mut sessions = self.sessions.write().await;
        // Lost the construction race to another connection.
        if let Some(session) = sessions.get(room_id) {
            return Ok(session.clone());
        }

        let doc = self.restore_document(room_id, &room.crdt_state, &room.code_snapshot).await?;
        let session = Arc::new(RoomSession::new(room_id, doc));
        sessions.insert(room_id.to_string(), session.clone());
        drop(sessions);

        self.install_snapshot_timer(&session).await;
        info!(room_id, "document initialized");
        Ok(session)
    }

    async fn restore_document(
        &self,
        room_id: &str,
        room_state: &Option<Vec<u8>>,
        room_content: &str,
    ) -> Result<Doc> {
        // (a) The room's persisted state, if it passes validation.
        if let Some(state) = room_state {
            if let Some(doc) = decode_validated(state) {
                debug!(room_id, "restored document from room state");
                return Ok(doc);
            }
            warn!(room_id, "room crdt state failed validation, trying snapshots");
        }

        let latest = self.rooms.latest_snapshot(room_id).await?;

        // (b) The latest snapshot's state.
        if let Some(snapshot) = &latest {
            if let Some(state) = &snapshot.crdt_state {
                if let Some(doc) = decode_validated(state) {
                    debug!(room_id, snapshot_id = %snapshot.id, "restored document from snapshot state");
                    return Ok(doc);
                }
                warn!(room_id, "snapshot crdt state failed validation, seeding from content");
            }
        }

        // (c) Seed the text field from snapshot or room content, else empty.
        let seed = latest
            .as_ref()
            .map(|s| s.content.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or(room_content);

        let doc = Doc::new();
        if !seed.is_empty() {
            let text = doc.get_or_insert_text(CODE_FIELD);
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, seed);
        }
        Ok(doc)
    }

    async fn install_snapshot_timer(self: &Arc<Self>, session: &Arc<RoomSession>) {
        let service = Arc::clone(self);
        let session_ref = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate first tick would snapshot a document nobody has
            // touched yet.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = service.periodic_flush(&session_ref).await {
                    error!(room_id = %session_ref.room_id, "periodic snapshot failed: {e}");
                }
            }
        });
        *session.timer.lock().await = Some(handle);
    }

    /// Timer body: flush the debounced state write and take an Auto snapshot
    /// when the document has content.
    async fn periodic_flush(&self, session: &Arc<RoomSession>) -> Result<()> {
        let (content, encoded, dirty) = {
            let mut state = session.state.lock().await;
            let content = doc_content(&state.doc);
            let encoded = encode_full_state(&state.doc);
            let dirty = state.dirty;
            state.dirty = false;
            state.last_state_persist = Instant::now();
            (content, encoded, dirty)
        };

        if dirty {
            self.rooms
                .update_crdt_state(&session.room_id, &encoded)
                .await?;
        }
        if !content.is_empty() {
            self.rooms
                .insert_snapshot(&session.room_id, &content, Some(&encoded), SnapshotKind::Auto)
                .await?;
        }
        Ok(())
    }

    /// Content of the room's document only when it is already in memory;
    /// never constructs a session.
    pub async fn live_content(&self, room_id: &str) -> Option<String> {
        let session = self.sessions.read().await.get(room_id).cloned()?;
        let state = session.state.lock().await;
        Some(doc_content(&state.doc))
    }

    /// Current text of the room's `code` field.
    pub async fn document_content(self: &Arc<Self>, room_id: &str) -> Result<String> {
        let session = self.initialize_document(room_id).await?;
        let state = session.state.lock().await;
        Ok(doc_content(&state.doc))
    }

    /// Apply one client update under the room's lane. Rejects empty or
    /// undecodable payloads; application errors go through conflict
    /// resolution.
    pub async fn apply_client_update(
        self: &Arc<Self>,
        room_id: &str,
        payload: &[u8],
    ) -> Result<ApplyOutcome> {
        self.apply_client_update_with(room_id, payload, |_| {}).await
    }

    /// Like [`apply_client_update`], but invokes `on_applied` with the
    /// accepted bytes while the apply lane is still held, so fan-out
    /// preserves apply order.
    ///
    /// [`apply_client_update`]: Self::apply_client_update
    pub async fn apply_client_update_with<F>(
        self: &Arc<Self>,
        room_id: &str,
        payload: &[u8],
        on_applied: F,
    ) -> Result<ApplyOutcome>
    where
        F: FnOnce(&[u8]),
    {
        if payload.is_empty() {
            return Err(SyncError::InvalidUpdate);
        }
        let session = self.initialize_document(room_id).await?;
        let mut state = session.state.lock().await;

        let applied = {
            let update = Update::decode_v1(payload).map_err(|_| SyncError::InvalidUpdate)?;
            state.doc.transact_mut().apply_update(update)
        };
        let outcome = match applied {
            Ok(()) => {
                on_applied(payload);
                ApplyOutcome::Applied {
                    update: payload.to_vec(),
                }
            }
            Err(e) => {
                warn!(room_id, "update application failed, starting recovery: {e}");
                let resolved_state = self.resolve_conflict(room_id, &mut state, payload).await?;
                ApplyOutcome::ConflictResolved { resolved_state }
            }
        };

        state.update_count += 1;
        state.dirty = true;

        // Threshold snapshot, then the debounced latest-state persist.
        if state.update_count >= SNAPSHOT_UPDATE_THRESHOLD {
            state.update_count = 0;
            let content = doc_content(&state.doc);
            let encoded = encode_full_state(&state.doc);
            self.rooms
                .insert_snapshot(room_id, &content, Some(&encoded), SnapshotKind::Auto)
                .await?;
        }
        if state.last_state_persist.elapsed() >= STATE_PERSIST_DEBOUNCE {
            let encoded = encode_full_state(&state.doc);
            state.last_state_persist = Instant::now();
            state.dirty = false;
            self.rooms.update_crdt_state(room_id, &encoded).await?;
        }

        Ok(outcome)
    }

    /// Two-stage conflict recovery. Stage one replays the current state plus
    /// the failing update into a scratch document and swaps it in; stage two
    /// falls back to the latest snapshot.
    async fn resolve_conflict(
        &self,
        room_id: &str,
        state: &mut SessionState,
        failing_update: &[u8],
    ) -> Result<Vec<u8>> {
        // Known-good backup before touching anything.
        let good_content = doc_content(&state.doc);
        let good_state = encode_full_state(&state.doc);
        self.rooms
            .insert_snapshot(room_id, &good_content, Some(&good_state), SnapshotKind::Backup)
            .await?;

        let merged = merge_into_scratch(&good_state, failing_update);
        if let Some(scratch) = merged {
            let resolved = encode_full_state(&scratch);
            state.doc = scratch;
            self.rooms.update_crdt_state(room_id, &resolved).await?;
            info!(room_id, "conflict resolved via scratch document");
            return Ok(resolved);
        }

        // Still failing: roll back to the latest snapshot.
        error!(room_id, "scratch merge failed, restoring from snapshot");
        let latest = self.rooms.latest_snapshot(room_id).await?;
        state.doc = restore_from_snapshot(latest.as_ref());
        Err(SyncError::ConflictResolutionFailed(room_id.to_string()))
    }

    /// Encoded state vector of the room's document.
    pub async fn encode_state_vector(self: &Arc<Self>, room_id: &str) -> Result<Vec<u8>> {
        let session = self.initialize_document(room_id).await?;
        let state = session.state.lock().await;
        let encoded = state.doc.transact().state_vector().encode_v1();
        Ok(encoded)
    }

    /// Minimal delta a peer with `state_vector` needs; the full state when
    /// the vector is absent. Undecodable vectors are rejected.
    pub async fn encode_diff(
        self: &Arc<Self>,
        room_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let peer_vector = match state_vector {
            Some(bytes) => {
                StateVector::decode_v1(bytes).map_err(|_| SyncError::InvalidStateVector)?
            }
            None => StateVector::default(),
        };

        let session = self.initialize_document(room_id).await?;
        let state = session.state.lock().await;
        let encoded = state.doc.transact().encode_state_as_update_v1(&peer_vector);
        Ok(encoded)
    }

    /// Write a snapshot of the current document and prune the room's history.
    pub async fn create_snapshot(
        self: &Arc<Self>,
        room_id: &str,
        kind: SnapshotKind,
    ) -> Result<Snapshot> {
        let session = self.initialize_document(room_id).await?;
        let state = session.state.lock().await;
        let content = doc_content(&state.doc);
        let encoded = encode_full_state(&state.doc);
        Ok(self
            .rooms
            .insert_snapshot(room_id, &content, Some(&encoded), kind)
            .await?)
    }

    /// Round-trip the document through its encoding and compare the text,
    /// plus soft checks surfaced as warnings.
    pub async fn validate_integrity(self: &Arc<Self>, room_id: &str) -> Result<IntegrityReport> {
        let session = self.initialize_document(room_id).await?;
        let latest = self.rooms.latest_snapshot(room_id).await?;
        let state = session.state.lock().await;
        Ok(integrity_of(&state.doc, latest.as_ref()))
    }

    /// Persist pending state, cancel the room's timer and drop the document.
    pub async fn cleanup_room(&self, room_id: &str) {
        let session = self.sessions.write().await.remove(room_id);
        let Some(session) = session else { return };

        if let Some(timer) = session.timer.lock().await.take() {
            timer.abort();
        }

        let state = session.state.lock().await;
        let encoded = encode_full_state(&state.doc);
        if let Err(e) = self.rooms.update_crdt_state(room_id, &encoded).await {
            warn!(room_id, "final state persist failed: {e}");
        }
        info!(room_id, "document released");
    }

    /// Room ids with a live in-memory document.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

fn doc_content(doc: &Doc) -> String {
    let text = doc.get_or_insert_text(CODE_FIELD);
    let txn = doc.transact();
    text.get_string(&txn)
}

fn encode_full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// Decode a full-state update into a fresh document, returning it only when
/// the round-trip validation holds.
fn decode_validated(state: &[u8]) -> Option<Doc> {
    if state.is_empty() {
        return None;
    }
    let update = Update::decode_v1(state).ok()?;
    let doc = Doc::new();
    doc.transact_mut().apply_update(update).ok()?;
    if integrity_of(&doc, None).is_ok() {
        Some(doc)
    } else {
        None
    }
}

/// Replay `(state, update)` into a scratch document.
fn merge_into_scratch(state: &[u8], failing_update: &[u8]) -> Option<Doc> {
    let doc = Doc::new();
    {
        let base = Update::decode_v1(state).ok()?;
        doc.transact_mut().apply_update(base).ok()?;
    }
    let update = Update::decode_v1(failing_update).ok()?;
    doc.transact_mut().apply_update(update).ok()?;
    Some(doc)
}

fn restore_from_snapshot(snapshot: Option<&Snapshot>) -> Doc {
    if let Some(snapshot) = snapshot {
        if let Some(state) = &snapshot.crdt_state {
            if let Some(doc) = decode_validated(state) {
                return doc;
            }
        }
        // Snapshot content is the authoritative fallback.
        let doc = Doc::new();
        if !snapshot.content.is_empty() {
            let text = doc.get_or_insert_text(CODE_FIELD);
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, &snapshot.content);
        }
        return doc;
    }
    Doc::new()
}

fn integrity_of(doc: &Doc, latest_snapshot: Option<&Snapshot>) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let original = doc_content(doc);
    let encoded = encode_full_state(doc);

    match Update::decode_v1(&encoded) {
        Err(e) => report.errors.push(format!("state does not decode: {e}")),
        Ok(update) => {
            let probe = Doc::new();
            match probe.transact_mut().apply_update(update) {
                Err(e) => report.errors.push(format!("state does not re-apply: {e}")),
                Ok(()) => {
                    let round_tripped = doc_content(&probe);
                    if round_tripped != original {
                        report.errors.push(format!(
                            "content mismatch after round-trip ({} vs {} chars)",
                            original.len(),
                            round_tripped.len()
                        ));
                    }
                }
            };
        }
    }

    if encoded.len() > STATE_SIZE_WARNING_BYTES {
        report
            .warnings
            .push(format!("encoded state is large: {} bytes", encoded.len()));
    }
    if let Some(snapshot) = latest_snapshot {
        let divergence = original.len().abs_diff(snapshot.content.len());
        if divergence > DIVERGENCE_WARNING_CHARS {
            report.warnings.push(format!(
                "content diverges from latest snapshot by {divergence} chars"
            ));
        }
    }

    report
}
