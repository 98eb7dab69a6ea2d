//! In-memory store — `HashMap`-backed [`Store`] implementation.
//!
//! DESIGN
//! ======
//! Backs the test suite and the no-database fallback mode. Behaviorally
//! equivalent to the Postgres store for every trait method: updates to
//! missing rows are no-ops, soft-deleted messages stay readable, and
//! message ids are allocated sequentially.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::event::{Chat, ChatType, Message, NewMessage, User, now_ms};
use crate::store::{Store, StoreError};

#[derive(Default)]
struct Inner {
    users: HashMap<i64, User>,
    chats: HashMap<i64, Chat>,
    members: HashSet<(i64, i64)>,
    messages: HashMap<i64, Message>,
    next_message_id: i64,
}

/// Volatile [`Store`] over process memory.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Two users sharing one private chat. Lets the server do something
    /// useful when it runs without `DATABASE_URL`.
    pub async fn with_demo_data() -> Self {
        let store = Self::new();
        store
            .add_user(User { id: 1, username: "alice".into(), is_online: false, last_seen_at: None })
            .await;
        store
            .add_user(User { id: 2, username: "bob".into(), is_online: false, last_seen_at: None })
            .await;
        store
            .add_chat(Chat {
                id: 1,
                chat_type: ChatType::Private,
                name: "alice and bob".into(),
                owner_id: 1,
                user1_id: Some(1),
                user2_id: Some(2),
            })
            .await;
        store
    }

    pub async fn add_user(&self, user: User) {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user.id, user);
    }

    /// Insert a chat and seed memberships for the owner and, for private
    /// chats, both distinguished participants.
    pub async fn add_chat(&self, chat: Chat) {
        let mut inner = self.inner.lock().await;
        inner.members.insert((chat.id, chat.owner_id));
        if let Some(user1) = chat.user1_id {
            inner.members.insert((chat.id, user1));
        }
        if let Some(user2) = chat.user2_id {
            inner.members.insert((chat.id, user2));
        }
        inner.chats.insert(chat.id, chat);
    }

    pub async fn add_member(&self, chat_id: i64, user_id: i64) {
        let mut inner = self.inner.lock().await;
        inner.members.insert((chat_id, user_id));
    }

    #[cfg(test)]
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn chat(&self, id: i64) -> Result<Option<Chat>, StoreError> {
        Ok(self.inner.lock().await.chats.get(&id).cloned())
    }

    async fn is_permitted(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        if inner.members.contains(&(chat_id, user_id)) {
            return Ok(true);
        }
        Ok(inner.chats.get(&chat_id).is_some_and(|chat| {
            chat.chat_type == ChatType::Private
                && (chat.user1_id == Some(user_id) || chat.user2_id == Some(user_id))
        }))
    }

    async fn user(&self, id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            chat_id: new.chat_id,
            message_type: new.message_type,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            is_seen: false,
            seen_at: None,
            is_edited: false,
            is_reacted: false,
            is_deleted: false,
            created_at: now_ms(),
        };
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn message(&self, id: i64) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.lock().await.messages.get(&id).cloned())
    }

    async fn update_message_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.messages.get_mut(&id) {
            stored.content = content.to_string();
            stored.is_edited = true;
        }
        Ok(())
    }

    async fn mark_message_seen(&self, id: i64, seen_at_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.messages.get_mut(&id) {
            if !stored.is_seen {
                stored.is_seen = true;
                stored.seen_at = Some(seen_at_ms);
            }
        }
        Ok(())
    }

    async fn soft_delete_message(&self, id: i64, _deleted_at_ms: i64) -> Result<(), StoreError> {
        // The deletion stamp is an audit column; memory keeps the flag only.
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.messages.get_mut(&id) {
            stored.is_deleted = true;
        }
        Ok(())
    }

    async fn set_user_presence(
        &self,
        user_id: i64,
        online: bool,
        last_seen_ms: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.is_online = online;
            user.last_seen_at = Some(last_seen_ms);
        }
        Ok(())
    }
}
