//! Message service — lifecycle state machine over the store.
//!
//! DESIGN
//! ======
//! A message is created in Sent state and moves through orthogonal edit
//! and seen transitions until an optional soft delete, which is terminal.
//! Each operation re-reads the row, enforces its guard order, and writes
//! only the columns its transition owns, so an edit racing a mark-seen
//! can never write the seen pair back stale.
//!
//! ERROR HANDLING
//! ==============
//! Guards are typed errors, not booleans. Seen/edit scope their lookup to
//! the addressee/sender, so an outsider cannot distinguish "not yours"
//! from "does not exist". Delete answers the sender check first and stays
//! Forbidden for non-senders on every call, deleted or not.

use tracing::info;

use crate::event::{Message, MessageType, NewMessage, now_ms};
use crate::store::{Store, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("chat not found: {0}")]
    ChatNotFound(i64),
    #[error("message not found: {0}")]
    NotFound(i64),
    #[error("user {user_id} is not permitted in chat {chat_id}")]
    Forbidden { chat_id: i64, user_id: i64 },
    #[error("unsupported message type: {0}")]
    InvalidType(String),
    #[error("message {0} is deleted")]
    Terminal(i64),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a message in Sent state and return the persisted snapshot.
///
/// The chat and the sender's permission are re-checked here, not trusted
/// from connect time. A named receiver that no longer resolves degrades
/// to no direct recipient.
///
/// # Errors
///
/// `InvalidType` for an unknown type tag, `ChatNotFound`/`Forbidden` when
/// the re-checks fail, or a storage error if any read or the insert
/// fails.
pub async fn send(
    store: &dyn Store,
    chat_id: i64,
    sender_id: i64,
    receiver_id: Option<i64>,
    message_type: &str,
    content: &str,
) -> Result<Message, MessageError> {
    let Some(message_type) = MessageType::from_tag(message_type) else {
        return Err(MessageError::InvalidType(message_type.to_string()));
    };

    if store.chat(chat_id).await?.is_none() {
        return Err(MessageError::ChatNotFound(chat_id));
    }
    if !store.is_permitted(chat_id, sender_id).await? {
        return Err(MessageError::Forbidden { chat_id, user_id: sender_id });
    }

    let recipient_id = match receiver_id {
        Some(id) => store.user(id).await?.map(|user| user.id),
        None => None,
    };

    let message = store
        .insert_message(NewMessage {
            chat_id,
            sender_id,
            recipient_id,
            message_type,
            content: content.to_string(),
        })
        .await?;

    info!(
        message_id = message.id,
        chat_id,
        kind = message.message_type.as_tag(),
        ts = message.created_at,
        "message persisted"
    );
    Ok(message)
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// Mark a message seen by its addressee and stamp `seen_at` once.
///
/// Idempotent: a message already seen is returned unchanged, so repeat
/// calls re-broadcast the original `seen_at` instead of rewinding it.
///
/// # Errors
///
/// `NotFound` unless a message with this id addressed to `reader_id`
/// exists, `Terminal` if it was deleted, or a storage error if the read
/// or update fails.
pub async fn mark_seen(
    store: &dyn Store,
    message_id: i64,
    reader_id: i64,
) -> Result<Message, MessageError> {
    let Some(mut message) = store.message(message_id).await? else {
        return Err(MessageError::NotFound(message_id));
    };
    if message.recipient_id != Some(reader_id) {
        return Err(MessageError::NotFound(message_id));
    }
    if message.is_deleted {
        return Err(MessageError::Terminal(message_id));
    }
    if message.is_seen {
        return Ok(message);
    }

    let stamp = now_ms();
    store.mark_message_seen(message_id, stamp).await?;
    message.is_seen = true;
    message.seen_at = Some(stamp);
    Ok(message)
}

/// Replace a message's content and flag it edited.
///
/// Editing to the identical content is a no-op that leaves `is_edited`
/// untouched.
///
/// # Errors
///
/// `NotFound` unless a message with this id sent by `editor_id` exists,
/// `Terminal` if it was deleted, or a storage error if the read or update
/// fails.
pub async fn edit(
    store: &dyn Store,
    message_id: i64,
    editor_id: i64,
    new_content: &str,
) -> Result<Message, MessageError> {
    let Some(mut message) = store.message(message_id).await? else {
        return Err(MessageError::NotFound(message_id));
    };
    if message.sender_id != editor_id {
        return Err(MessageError::NotFound(message_id));
    }
    if message.is_deleted {
        return Err(MessageError::Terminal(message_id));
    }
    if message.content == new_content {
        return Ok(message);
    }

    store.update_message_content(message_id, new_content).await?;
    message.content = new_content.to_string();
    message.is_edited = true;
    Ok(message)
}

/// Soft-delete a message. Returns whether this call performed the
/// deletion; `false` means it was already gone and no event is owed.
///
/// # Errors
///
/// `NotFound` if the id does not exist, `Forbidden` unless `requester_id`
/// is the sender (answered before the idempotency short-circuit), or a
/// storage error if the read or update fails.
pub async fn soft_delete(
    store: &dyn Store,
    message_id: i64,
    requester_id: i64,
) -> Result<bool, MessageError> {
    let Some(message) = store.message(message_id).await? else {
        return Err(MessageError::NotFound(message_id));
    };
    if message.sender_id != requester_id {
        return Err(MessageError::Forbidden { chat_id: message.chat_id, user_id: requester_id });
    }
    if message.is_deleted {
        return Ok(false);
    }

    store.soft_delete_message(message_id, now_ms()).await?;
    info!(message_id, chat_id = message.chat_id, "message soft-deleted");
    Ok(true)
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
