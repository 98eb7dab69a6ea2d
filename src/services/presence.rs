//! Presence service — live online state with persisted write-through.
//!
//! DESIGN
//! ======
//! The tracker is the authority for users connected to this process; the
//! `users` row is the durable shadow that other readers and offline
//! queries see. Transitions update memory first, then write the row, both
//! under the user's own lock, so transitions for one user apply in call
//! order and the stamped last-seen belongs to the transition that wrote
//! it.
//!
//! ERROR HANDLING
//! ==============
//! A failed write-through returns the store error. Going online, the
//! in-memory flip is rolled back: the caller aborts the connect, and the
//! user must not linger visibly online with no live session. Going
//! offline, the flip is kept and live queries stay coherent while the
//! row lags behind until the next successful transition.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::event::now_ms;
use crate::store::{Store, StoreError};

/// One user's presence as the wire reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub last_seen_ms: Option<i64>,
}

/// Shared tracker. Cheap to clone; all clones see the same users.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn Store>,
    users: Arc<RwLock<HashMap<i64, Arc<Mutex<Presence>>>>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, users: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn slot(&self, user_id: i64) -> Arc<Mutex<Presence>> {
        {
            let users = self.users.read().await;
            if let Some(slot) = users.get(&user_id) {
                return Arc::clone(slot);
            }
        }
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id).or_default())
    }

    async fn tracked(&self, user_id: i64) -> Option<Arc<Mutex<Presence>>> {
        let users = self.users.read().await;
        users.get(&user_id).map(Arc::clone)
    }

    async fn transition(&self, user_id: i64, online: bool) -> Result<Presence, StoreError> {
        let slot = self.slot(user_id).await;

        // The per-user lock is held across the write-through so memory and
        // row transition together.
        let mut presence = slot.lock().await;
        let prior = *presence;
        let stamp = now_ms();
        presence.online = online;
        presence.last_seen_ms = Some(stamp);
        let snapshot = *presence;

        if let Err(e) = self.store.set_user_presence(user_id, online, stamp).await {
            // A failed online flip aborts the connect, so memory must not
            // keep claiming the user is online; restoring the prior state
            // keeps an already-online user online when an extra session
            // fails. A failed offline flip keeps the flip: the session is
            // gone regardless and the row catches up next transition.
            if online {
                *presence = prior;
            }
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Mark a user online and stamp last-seen.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write-through fails. The in-memory
    /// flip is rolled back when that happens, since the caller treats the
    /// failure as connection-fatal.
    pub async fn set_online(&self, user_id: i64) -> Result<Presence, StoreError> {
        self.transition(user_id, true).await
    }

    /// Mark a user offline and stamp last-seen.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write-through fails. The in-memory
    /// flip is kept when that happens; only the row write was lost.
    pub async fn set_offline(&self, user_id: i64) -> Result<Presence, StoreError> {
        self.transition(user_id, false).await
    }

    /// Live online flag. `false` for users this process never tracked.
    pub async fn is_online(&self, user_id: i64) -> bool {
        match self.tracked(user_id).await {
            Some(slot) => slot.lock().await.online,
            None => false,
        }
    }

    /// Presence snapshot for a user. Tracked users answer from live
    /// state; everyone else answers from their stored row, and an unknown
    /// user reads as offline with no last-seen.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the fallback row read fails.
    pub async fn query(&self, user_id: i64) -> Result<Presence, StoreError> {
        if let Some(slot) = self.tracked(user_id).await {
            return Ok(*slot.lock().await);
        }

        let user = self.store.user(user_id).await?;
        Ok(user.map_or_else(Presence::default, |u| Presence {
            online: u.is_online,
            last_seen_ms: u.last_seen_at,
        }))
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
