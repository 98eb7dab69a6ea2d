//! Event — the wire types for chatrelay.
//!
//! ARCHITECTURE
//! ============
//! Clients send JSON text frames tagged by `EVENT_TYPE`. Inbound frames
//! decode once at the websocket boundary into [`ClientEvent`], a closed
//! enum, and are dispatched by exhaustive match. Outbound broadcasts are
//! [`ServerEvent`] values encoded with the same `EVENT_TYPE` vocabulary
//! plus a `type` handler field the clients route on.
//!
//! DESIGN
//! ======
//! - Unknown `EVENT_TYPE` tags fail deserialization; the session drops
//!   such frames instead of disconnecting.
//! - `message_type` arrives as a plain string and is validated by the
//!   message service, so an unsupported tag is a typed error rather
//!   than a decode failure.
//! - Timestamps are milliseconds since Unix epoch, `i64` end to end.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// DOMAIN TYPES
// =============================================================================

/// Chat kind. Closed set; stored as its uppercase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatType {
    Private,
    Group,
    Channel,
}

impl ChatType {
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "PRIVATE" => Some(ChatType::Private),
            "GROUP" => Some(ChatType::Group),
            "CHANNEL" => Some(ChatType::Channel),
            _ => None,
        }
    }
}

/// Message payload kind. Only TEXT content gets first-class handling;
/// the other tags are accepted and stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
}

impl MessageType {
    #[must_use]
    pub fn as_tag(self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Image => "IMAGE",
            MessageType::Video => "VIDEO",
            MessageType::Audio => "AUDIO",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "TEXT" => Some(MessageType::Text),
            "IMAGE" => Some(MessageType::Image),
            "VIDEO" => Some(MessageType::Video),
            "AUDIO" => Some(MessageType::Audio),
            _ => None,
        }
    }
}

/// A chat row as the session layer consumes it.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: i64,
    pub chat_type: ChatType,
    pub name: String,
    pub owner_id: i64,
    /// Distinguished participants, set only for PRIVATE chats.
    pub user1_id: Option<i64>,
    pub user2_id: Option<i64>,
}

/// A user row. `is_online` and `last_seen_at` are the persisted side of
/// presence; the live side is the in-memory presence tracker.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_online: bool,
    pub last_seen_at: Option<i64>,
}

/// In-memory representation of a message. Mirrors the `messages` table
/// minus the audit-only `deleted_at` column.
///
/// `is_deleted` never reaches the wire: a deleted message is broadcast
/// as a bare `msg_id` and terminality is enforced before any snapshot
/// is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub message_type: MessageType,
    pub sender_id: i64,
    pub recipient_id: Option<i64>,
    pub content: String,
    pub is_seen: bool,
    pub seen_at: Option<i64>,
    pub is_edited: bool,
    pub is_reacted: bool,
    #[serde(skip)]
    pub is_deleted: bool,
    pub created_at: i64,
}

/// Fields the sender controls when creating a message. The store stamps
/// identity and `created_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub recipient_id: Option<i64>,
    pub message_type: MessageType,
    pub content: String,
}

// =============================================================================
// ROOM KEYS
// =============================================================================

/// Broadcast room key for a chat. One room per chat.
#[must_use]
pub fn room_key(chat: &Chat) -> String {
    match chat.chat_type {
        ChatType::Private => format!("private_chat_{}", chat.id),
        ChatType::Group | ChatType::Channel => format!("group_{}", chat.id),
    }
}

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// A decoded client frame. The `EVENT_TYPE` tag selects the variant;
/// anything that does not match is an invalid frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "EVENT_TYPE", rename_all = "snake_case")]
pub enum ClientEvent {
    CheckPrivateChatUserOnline {
        user_id: i64,
    },
    PrivateChatSendMessage {
        #[serde(default)]
        receiver_id: Option<i64>,
        message_type: String,
        message_text: String,
    },
    PrivateChatUserTypingStatus {
        user_id: i64,
        is_typing: bool,
    },
    PrivateChatSeeMessage {
        message_id: i64,
    },
    PrivateChatEditMessage {
        message_id: i64,
        message_text: String,
    },
    PrivateChatMessageDelete {
        message_id: i64,
    },
}

// =============================================================================
// OUTBOUND EVENTS
// =============================================================================

/// A broadcast leaving the server. Encoded as
/// `{"type": <handler>, "EVENT_TYPE": <tag>, ...fields}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "EVENT_TYPE", rename_all = "snake_case")]
pub enum ServerEvent {
    CheckPrivateChatUserOnline {
        user_id: i64,
        is_online: bool,
        last_seen_at: Option<i64>,
    },
    PrivateChatSendMessage {
        message: Message,
    },
    PrivateChatUserTypingStatus {
        user_id: i64,
        is_typing: bool,
    },
    PrivateChatSeeMessage {
        message: Message,
    },
    PrivateChatEditMessage {
        message: Message,
    },
    PrivateChatMessageDelete {
        msg_id: i64,
    },
}

impl ServerEvent {
    /// The `EVENT_TYPE` tag, for logs and assertions.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::CheckPrivateChatUserOnline { .. } => "check_private_chat_user_online",
            ServerEvent::PrivateChatSendMessage { .. } => "private_chat_send_message",
            ServerEvent::PrivateChatUserTypingStatus { .. } => "private_chat_user_typing_status",
            ServerEvent::PrivateChatSeeMessage { .. } => "private_chat_see_message",
            ServerEvent::PrivateChatEditMessage { .. } => "private_chat_edit_message",
            ServerEvent::PrivateChatMessageDelete { .. } => "private_chat_message_delete",
        }
    }

    /// The client-side handler name carried in the `type` field.
    #[must_use]
    pub fn handler(&self) -> &'static str {
        match self {
            ServerEvent::CheckPrivateChatUserOnline { .. } => "send_online_offline_event",
            _ => "send_private_chat_message",
        }
    }

    /// Encode for the wire, injecting the `type` handler field beside
    /// the serialized payload.
    #[must_use]
    pub fn to_wire_json(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("type".into(), serde_json::Value::String(self.handler().into()));
        }
        value.to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
