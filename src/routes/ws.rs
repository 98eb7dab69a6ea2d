//! WebSocket handler — chat session relay.
//!
//! DESIGN
//! ======
//! The connect path authorizes before the upgrade, so a rejected client
//! gets a plain HTTP status instead of a websocket close. After the
//! upgrade the session joins its chat room, flips presence online, and
//! enters a `select!` loop:
//! - Incoming client frames → decode + dispatch by `EVENT_TYPE`
//! - Broadcasts from room peers → forward to the client
//!
//! Handlers hand every outbound event to the hub; the relay loop itself
//! never fabricates events, and the sender hears its own broadcasts back
//! like any other room member.
//!
//! LIFECYCLE
//! =========
//! 1. Authorize (401/404/403/500) → upgrade
//! 2. Join room → presence online → broadcast online event
//! 3. Frames in → state machine / presence → broadcast result
//! 4. Close/error/panic → leave room → presence offline → broadcast
//!    offline event, exactly once
//!
//! ERROR HANDLING
//! ==============
//! In-session failures never disconnect: malformed frames and state
//! machine rejections are logged and dropped, nothing is echoed to the
//! sender. A store failure while flipping online is connection-fatal and
//! backs out fully (room left, presence restored, no broadcast); one
//! while flipping offline is logged and the offline broadcast still goes
//! out with a locally stamped last-seen.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{Chat, ClientEvent, ServerEvent, User, now_ms, room_key};
use crate::services::message::{self, MessageError};
use crate::services::presence::Presence;
use crate::state::AppState;
use crate::store::StoreError;

// =============================================================================
// REJECTION
// =============================================================================

/// Why a connect attempt was refused before the upgrade.
#[derive(Debug, thiserror::Error)]
enum SessionRejection {
    #[error("user_id required")]
    Unauthorized,
    #[error("chat not found")]
    ChatNotFound,
    #[error("not a member of this chat")]
    Forbidden,
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for SessionRejection {
    fn into_response(self) -> Response {
        match self {
            SessionRejection::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "user_id required").into_response()
            }
            SessionRejection::ChatNotFound => {
                (StatusCode::NOT_FOUND, "chat not found").into_response()
            }
            SessionRejection::Forbidden => {
                (StatusCode::FORBIDDEN, "not a member of this chat").into_response()
            }
            SessionRejection::Storage(e) => {
                tracing::error!(error = %e, "ws: connect-time store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
            }
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match authorize(&state, chat_id, &params).await {
        Ok((chat, user)) => ws.on_upgrade(move |socket| run_session(socket, state, chat, user)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Resolve the caller and check chat access, in rejection-priority order:
/// identity, then existence, then permission.
async fn authorize(
    state: &AppState,
    chat_id: i64,
    params: &HashMap<String, String>,
) -> Result<(Chat, User), SessionRejection> {
    let user_id = params
        .get("user_id")
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or(SessionRejection::Unauthorized)?;
    let Some(user) = state.store.user(user_id).await? else {
        return Err(SessionRejection::Unauthorized);
    };

    let Some(chat) = state.store.chat(chat_id).await? else {
        return Err(SessionRejection::ChatNotFound);
    };
    if !state.store.is_permitted(chat_id, user.id).await? {
        return Err(SessionRejection::Forbidden);
    }

    Ok((chat, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_session(mut socket: WebSocket, state: AppState, chat: Chat, user: User) {
    let session_id = Uuid::new_v4();
    let room = room_key(&chat);
    let user_id = user.id;

    // Per-session channel for events broadcast by room peers.
    let (session_tx, mut session_rx) = mpsc::channel::<ServerEvent>(256);

    state.hub.join(&room, session_id, session_tx).await;

    // A store failure here is connect-fatal. The tracker has already
    // rolled its presence flip back; undo the join and close before any
    // broadcast side effect exists.
    let online = match state.presence.set_online(user_id).await {
        Ok(online) => online,
        Err(e) => {
            warn!(error = %e, user_id, "ws: presence online write failed; closing");
            state.hub.leave(&room, session_id).await;
            return;
        }
    };

    // From here on, disconnect duties run exactly once on every exit
    // path, panics included.
    let guard = SessionGuard {
        state: state.clone(),
        room: room.clone(),
        session_id,
        user_id,
        armed: true,
    };

    info!(
        %session_id,
        user_id,
        user = %user.username,
        chat_id = chat.id,
        chat = %chat.name,
        "ws: session connected"
    );

    state
        .hub
        .broadcast(
            &room,
            &ServerEvent::CheckPrivateChatUserOnline {
                user_id,
                is_online: online.online,
                last_seen_at: online.last_seen_ms,
            },
        )
        .await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        process_text(&state, &chat, &room, user_id, &text).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = session_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    guard.shutdown().await;
    info!(%session_id, user_id, "ws: session disconnected");
}

/// Runs the disconnect sequence exactly once. Normal exits call
/// [`SessionGuard::shutdown`]; a panicking session task runs it from
/// `Drop` on a spawned task instead.
struct SessionGuard {
    state: AppState,
    room: String,
    session_id: Uuid,
    user_id: i64,
    armed: bool,
}

impl SessionGuard {
    async fn shutdown(mut self) {
        self.armed = false;
        disconnect(&self.state, &self.room, self.session_id, self.user_id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = self.state.clone();
        let room = std::mem::take(&mut self.room);
        let session_id = self.session_id;
        let user_id = self.user_id;
        tokio::spawn(async move {
            disconnect(&state, &room, session_id, user_id).await;
        });
    }
}

/// Leave the room, flip presence offline, then tell the peers.
async fn disconnect(state: &AppState, room: &str, session_id: Uuid, user_id: i64) {
    state.hub.leave(room, session_id).await;

    let offline = match state.presence.set_offline(user_id).await {
        Ok(offline) => offline,
        Err(e) => {
            warn!(error = %e, user_id, "ws: presence offline write failed; broadcasting anyway");
            Presence { online: false, last_seen_ms: Some(now_ms()) }
        }
    };

    state
        .hub
        .broadcast(
            room,
            &ServerEvent::CheckPrivateChatUserOnline {
                user_id,
                is_online: offline.online,
                last_seen_at: offline.last_seen_ms,
            },
        )
        .await;
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Decode and process one inbound text frame.
///
/// This keeps websocket transport concerns in the relay loop and lets
/// tests exercise dispatch and broadcast behavior end-to-end without a
/// live socket.
async fn process_text(state: &AppState, chat: &Chat, room: &str, sender_id: i64, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, sender_id, "ws: dropping invalid frame");
            return;
        }
    };

    if let Err(e) = process_event(state, chat, room, sender_id, event).await {
        match &e {
            MessageError::Store(inner) => {
                warn!(error = %inner, sender_id, chat_id = chat.id, "ws: store failure; frame dropped");
            }
            _ => debug!(error = %e, sender_id, chat_id = chat.id, "ws: frame rejected"),
        }
    }
}

/// Dispatch one decoded event and broadcast whatever the room is owed.
async fn process_event(
    state: &AppState,
    chat: &Chat,
    room: &str,
    sender_id: i64,
    event: ClientEvent,
) -> Result<(), MessageError> {
    match event {
        ClientEvent::CheckPrivateChatUserOnline { user_id } => {
            let presence = state.presence.query(user_id).await?;
            state
                .hub
                .broadcast(
                    room,
                    &ServerEvent::CheckPrivateChatUserOnline {
                        user_id,
                        is_online: presence.online,
                        last_seen_at: presence.last_seen_ms,
                    },
                )
                .await;
        }
        ClientEvent::PrivateChatSendMessage { receiver_id, message_type, message_text } => {
            let message = message::send(
                state.store.as_ref(),
                chat.id,
                sender_id,
                receiver_id,
                &message_type,
                &message_text,
            )
            .await?;
            state.hub.broadcast(room, &ServerEvent::PrivateChatSendMessage { message }).await;
        }
        ClientEvent::PrivateChatUserTypingStatus { user_id, is_typing } => {
            // Ephemeral: relayed to the room, never persisted.
            state
                .hub
                .broadcast(room, &ServerEvent::PrivateChatUserTypingStatus { user_id, is_typing })
                .await;
        }
        ClientEvent::PrivateChatSeeMessage { message_id } => {
            let message = message::mark_seen(state.store.as_ref(), message_id, sender_id).await?;
            state.hub.broadcast(room, &ServerEvent::PrivateChatSeeMessage { message }).await;
        }
        ClientEvent::PrivateChatEditMessage { message_id, message_text } => {
            let message =
                message::edit(state.store.as_ref(), message_id, sender_id, &message_text).await?;
            state.hub.broadcast(room, &ServerEvent::PrivateChatEditMessage { message }).await;
        }
        ClientEvent::PrivateChatMessageDelete { message_id } => {
            // No event when the row was already deleted; peers saw it once.
            if message::soft_delete(state.store.as_ref(), message_id, sender_id).await? {
                state
                    .hub
                    .broadcast(room, &ServerEvent::PrivateChatMessageDelete { msg_id: message_id })
                    .await;
            }
        }
    }
    Ok(())
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    debug!(kind = event.kind(), "ws: send event");
    socket.send(Message::Text(event.to_wire_json().into())).await
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
