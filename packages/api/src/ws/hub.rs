// ABOUTME: Per-room registry of connection sinks for event fan-out
// ABOUTME: Synchronous sends so fan-out can run inside the CRDT apply lane

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc::UnboundedSender;

use super::protocol::ServerEvent;

/// Frames a connection's writer task can emit.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Protocol-level heartbeat ping.
    Ping,
    Close,
}

pub type ConnectionId = String;

/// Room -> connection -> sink. Senders are unbounded so fan-out never blocks
/// the apply lane; a dead peer's send errors are ignored and the connection
/// is removed on disconnect.
#[derive(Default)]
pub struct RoomHub {
    rooms: RwLock<HashMap<String, HashMap<ConnectionId, UnboundedSender<Outbound>>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room_id: &str, conn_id: &str, sender: UnboundedSender<Outbound>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), sender);
    }

    pub fn leave(&self, room_id: &str, conn_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        if let Some(room) = rooms.get_mut(room_id) {
            room.remove(conn_id);
            if room.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Send to every connection in the room except `except`.
    pub fn broadcast(&self, room_id: &str, event: ServerEvent, except: Option<&str>) {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        let Some(room) = rooms.get(room_id) else { return };
        for (conn_id, sender) in room {
            if Some(conn_id.as_str()) == except {
                continue;
            }
            let _ = sender.send(Outbound::Event(event.clone()));
        }
    }

    pub fn connection_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        rooms.get(room_id).map(|room| room.len()).unwrap_or(0)
    }
}
