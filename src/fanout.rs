//! Push fanout
//!
//! Room-addressed delivery to connected clients. A room is identified by a
//! chat fingerprint; every event for a chat is serialized once and written
//! to each member connection. Dead connections are swept on write.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::trace;

use crate::now_ms;

/// Addressing unit for push delivery:
/// `chat_{user}_{session}_{chat}[_{instance}]`. The instance id
/// disambiguates rapid resubmissions of the same chat.
pub fn fingerprint(
    user_id: &str,
    session_id: &str,
    chat_id: &str,
    instance_id: Option<&str>,
) -> String {
    match instance_id {
        Some(instance) if !instance.is_empty() => {
            format!("chat_{user_id}_{session_id}_{chat_id}_{instance}")
        }
        _ => format!("chat_{user_id}_{session_id}_{chat_id}"),
    }
}

/// The authoritative envelope every push event carries. Event-specific
/// fields are merged on top by the caller.
pub fn base_event(
    kind: &str,
    chat_id: &str,
    session_id: &str,
    instance_id: Option<&str>,
) -> Value {
    json!({
        "type": kind,
        "content": "",
        "chat_id": chat_id,
        "session_id": session_id,
        "instance_id": instance_id,
        "timestamp": now_ms(),
    })
}

struct RoomMember {
    conn_id: String,
    tx: mpsc::UnboundedSender<String>,
}

/// Registry of rooms and their member connections.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Vec<RoomMember>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room.
    pub fn join(&self, room: &str, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(room.to_string()).or_default();
        members.retain(|m| m.conn_id != conn_id);
        members.push(RoomMember {
            conn_id: conn_id.to_string(),
            tx,
        });
    }

    /// Remove a connection from a room.
    pub fn leave(&self, room: &str, conn_id: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|m| m.conn_id != conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, conn_id: &str) {
        let mut rooms = self.rooms.lock();
        rooms.retain(|_, members| {
            members.retain(|m| m.conn_id != conn_id);
            !members.is_empty()
        });
    }

    /// Deliver an event to every member of a room. Returns how many
    /// connections received it.
    pub fn emit(&self, room: &str, payload: &Value) -> usize {
        let serialized = match serde_json::to_string(payload) {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room) else {
            return 0;
        };
        let mut delivered = 0;
        members.retain(|m| match m.tx.send(serialized.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        if members.is_empty() {
            rooms.remove(room);
        }
        trace!(target: "server", room = %room, delivered, "room event");
        delivered
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.lock().get(room).map(Vec::len).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Drop every room. Part of the logout flush.
    pub fn clear(&self) {
        self.rooms.lock().clear();
    }
}
