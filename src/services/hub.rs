//! Hub service — room registry and broadcast fan-out.
//!
//! DESIGN
//! ======
//! A room is a set of live session senders keyed by session id. Rooms are
//! created lazily on first join and removed lazily by a background sweeper
//! once empty; nothing else ever destroys a room. Broadcast delivers to
//! every current member, sender included.
//!
//! LIFECYCLE
//! =========
//! Lock order is always the room map before a room's session set. Joins
//! insert under the map write lock, so the sweeper can never prune a room
//! between creation and first membership. Broadcast and leave clone the
//! room handle under the read lock and release it before touching the
//! session set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::env_parse;
use crate::event::ServerEvent;

const DEFAULT_ROOM_SWEEP_SECS: u64 = 30;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Default)]
struct Room {
    sessions: Mutex<HashMap<Uuid, mpsc::Sender<ServerEvent>>>,
}

/// Shared room registry. Cheap to clone; all clones see the same rooms.
#[derive(Clone, Default)]
pub struct Hub {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a room, creating the room if needed.
    pub async fn join(&self, room: &str, session_id: Uuid, tx: mpsc::Sender<ServerEvent>) {
        let mut rooms = self.rooms.write().await;
        let room_ref = rooms.entry(room.to_string()).or_insert_with(|| Arc::new(Room::default()));

        let size = {
            let mut sessions = room_ref.sessions.lock().await;
            sessions.insert(session_id, tx);
            sessions.len()
        };
        debug!(room, %session_id, size, "session joined room");
    }

    /// Remove a session from a room. The room itself stays registered
    /// until the sweeper prunes it.
    pub async fn leave(&self, room: &str, session_id: Uuid) {
        let room_ref = {
            let rooms = self.rooms.read().await;
            let Some(room_ref) = rooms.get(room) else {
                return;
            };
            Arc::clone(room_ref)
        };

        let remaining = {
            let mut sessions = room_ref.sessions.lock().await;
            sessions.remove(&session_id);
            sessions.len()
        };
        debug!(room, %session_id, remaining, "session left room");
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    /// Broadcast an event to every session in a room, sender included.
    pub async fn broadcast(&self, room: &str, event: &ServerEvent) {
        let room_ref = {
            let rooms = self.rooms.read().await;
            let Some(room_ref) = rooms.get(room) else {
                return;
            };
            Arc::clone(room_ref)
        };

        // The session set stays locked across the fan-out so events for the
        // same room keep one total order.
        let sessions = room_ref.sessions.lock().await;
        for tx in sessions.values() {
            // Best-effort: if a client's channel is full, skip it.
            let _ = tx.try_send(event.clone());
        }
    }

    // =========================================================================
    // SWEEPER
    // =========================================================================

    /// Remove every room with no live sessions. Returns the prune count.
    pub async fn prune_empty(&self) -> usize {
        let mut rooms = self.rooms.write().await;

        // A room observed empty here cannot gain a session before removal:
        // joins insert under this same write lock.
        let mut stale = Vec::new();
        for (key, room_ref) in rooms.iter() {
            if room_ref.sessions.lock().await.is_empty() {
                stale.push(key.clone());
            }
        }
        for key in &stale {
            rooms.remove(key);
        }
        stale.len()
    }

    #[cfg(test)]
    pub(crate) async fn room_size(&self, room: &str) -> Option<usize> {
        let rooms = self.rooms.read().await;
        let room_ref = rooms.get(room)?;
        let size = room_ref.sessions.lock().await.len();
        Some(size)
    }
}

/// Spawn the background room sweeper. Returns a handle for shutdown.
pub fn spawn_room_sweeper(hub: Hub) -> JoinHandle<()> {
    let sweep_secs = env_parse("ROOM_SWEEP_SECS", DEFAULT_ROOM_SWEEP_SECS);
    info!(sweep_secs, "room sweeper configured");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(sweep_secs)).await;
            let pruned = hub.prune_empty().await;
            if pruned > 0 {
                debug!(pruned, "swept empty rooms");
            }
        }
    })
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
