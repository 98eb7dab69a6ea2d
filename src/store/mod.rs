//! Store — the persistence gateway.
//!
//! SYSTEM CONTEXT
//! ==============
//! The messaging core consumes storage through this narrow trait: load a
//! chat, check permission, create/update a message, flip presence. The
//! Postgres implementation backs production; the in-memory one backs the
//! test suite and running without a database.
//!
//! ERROR HANDLING
//! ==============
//! Every call can fail with [`StoreError::Unavailable`]. Callers decide
//! severity: connect-time failures are connection-fatal, in-session
//! failures drop the frame.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::event::{Chat, Message, NewMessage, User};

pub use memory::MemStore;
pub use postgres::PgStore;

/// Errors produced by storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Narrow interface over chat, message, and user storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a chat by id. `None` if no such chat exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn chat(&self, id: i64) -> Result<Option<Chat>, StoreError>;

    /// Whether `user_id` may participate in `chat_id`: an active
    /// membership, or a distinguished participant slot on a private chat.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn is_permitted(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError>;

    /// Load a user by id. `None` if no such user exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn user(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Persist a new message and return it with identity and `created_at`
    /// stamped. Status flags start cleared.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the insert fails.
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    /// Load a message by id. Soft-deleted rows are returned with
    /// `is_deleted` set so callers can distinguish terminal from absent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn message(&self, id: i64) -> Result<Option<Message>, StoreError>;

    /// Replace a message's content and set its edited flag. Touches no
    /// other column, so a concurrent seen transition is never clobbered
    /// by a stale snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    async fn update_message_content(&self, id: i64, content: &str) -> Result<(), StoreError>;

    /// Set a message's seen flag and stamp `seen_at`. First writer wins:
    /// a message already seen keeps its original stamp.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    async fn mark_message_seen(&self, id: i64, seen_at_ms: i64) -> Result<(), StoreError>;

    /// Mark a message soft-deleted, stamping the deletion time.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    async fn soft_delete_message(&self, id: i64, deleted_at_ms: i64) -> Result<(), StoreError>;

    /// Write a user's presence fields.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    async fn set_user_presence(
        &self,
        user_id: i64,
        online: bool,
        last_seen_ms: i64,
    ) -> Result<(), StoreError>;
}
