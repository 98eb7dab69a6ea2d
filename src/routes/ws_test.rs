use super::*;
use crate::event::ChatType;
use crate::state::test_helpers;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite;

async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

async fn assert_no_event(rx: &mut mpsc::Receiver<ServerEvent>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no broadcast event"
    );
}

fn query(user_id: i64) -> HashMap<String, String> {
    HashMap::from([("user_id".to_string(), user_id.to_string())])
}

fn carol() -> User {
    User { id: 3, username: "carol".into(), is_online: false, last_seen_at: None }
}

async fn seeded_private_chat(state: &AppState) -> (Chat, String) {
    let chat = state.store.chat(1).await.expect("store read").expect("seeded chat");
    let room = room_key(&chat);
    (chat, room)
}

async fn register_two_sessions(
    state: &AppState,
    room: &str,
) -> (Uuid, mpsc::Receiver<ServerEvent>, Uuid, mpsc::Receiver<ServerEvent>) {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let (first_tx, first_rx) = mpsc::channel(32);
    let (second_tx, second_rx) = mpsc::channel(32);
    state.hub.join(room, first, first_tx).await;
    state.hub.join(room, second, second_tx).await;
    (first, first_rx, second, second_rx)
}

// =============================================================================
// AUTHORIZE
// =============================================================================

#[tokio::test]
async fn authorize_rejects_unknown_users_chats_and_outsiders() {
    let (state, store) = test_helpers::seeded_state().await;
    store.add_user(carol()).await;

    assert!(matches!(
        authorize(&state, 1, &HashMap::new()).await,
        Err(SessionRejection::Unauthorized)
    ));

    let unparseable = HashMap::from([("user_id".to_string(), "alice".to_string())]);
    assert!(matches!(
        authorize(&state, 1, &unparseable).await,
        Err(SessionRejection::Unauthorized)
    ));

    assert!(matches!(
        authorize(&state, 1, &query(404)).await,
        Err(SessionRejection::Unauthorized)
    ));
    assert!(matches!(
        authorize(&state, 404, &query(1)).await,
        Err(SessionRejection::ChatNotFound)
    ));
    assert!(matches!(authorize(&state, 1, &query(3)).await, Err(SessionRejection::Forbidden)));

    let (chat, user) = authorize(&state, 1, &query(1)).await.expect("member connects");
    assert_eq!(chat.id, 1);
    assert_eq!(chat.chat_type, ChatType::Private);
    assert_eq!(user.username, "alice");
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn send_then_see_reaches_both_sessions_with_stable_seen_stamp() {
    let (state, _store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(
        &state,
        &chat,
        &room,
        1,
        r#"{"EVENT_TYPE":"private_chat_send_message","receiver_id":2,"message_type":"TEXT","message_text":"hi"}"#,
    )
    .await;

    let to_alice = recv_event(&mut alice_rx).await;
    assert_eq!(to_alice.kind(), "private_chat_send_message");
    let ServerEvent::PrivateChatSendMessage { message } = recv_event(&mut bob_rx).await else {
        panic!("expected send event for bob");
    };
    assert_eq!(message.content, "hi");
    assert_eq!(message.sender_id, 1);
    assert!(!message.is_seen);

    let see = format!(r#"{{"EVENT_TYPE":"private_chat_see_message","message_id":{}}}"#, message.id);
    process_text(&state, &chat, &room, 2, &see).await;

    let ServerEvent::PrivateChatSeeMessage { message: seen } = recv_event(&mut alice_rx).await
    else {
        panic!("expected seen event for alice");
    };
    recv_event(&mut bob_rx).await;
    assert!(seen.is_seen);
    let stamp = seen.seen_at.expect("seen_at stamped");

    // A repeat rebroadcasts the original stamp, never a new one.
    process_text(&state, &chat, &room, 2, &see).await;
    let ServerEvent::PrivateChatSeeMessage { message: again } = recv_event(&mut alice_rx).await
    else {
        panic!("expected repeated seen event");
    };
    assert_eq!(again.seen_at, Some(stamp));
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_dropped_silently() {
    let (state, store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(&state, &chat, &room, 1, "not json at all").await;
    process_text(&state, &chat, &room, 1, r#"{"EVENT_TYPE":"reticulate_splines"}"#).await;
    process_text(&state, &chat, &room, 1, r#"{"EVENT_TYPE":"private_chat_see_message"}"#).await;

    assert_no_event(&mut alice_rx).await;
    assert_no_event(&mut bob_rx).await;
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn typing_status_relays_without_persisting() {
    let (state, store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(
        &state,
        &chat,
        &room,
        1,
        r#"{"EVENT_TYPE":"private_chat_user_typing_status","user_id":1,"is_typing":true}"#,
    )
    .await;

    let ServerEvent::PrivateChatUserTypingStatus { user_id, is_typing } =
        recv_event(&mut bob_rx).await
    else {
        panic!("expected typing event");
    };
    assert_eq!(user_id, 1);
    assert!(is_typing);
    recv_event(&mut alice_rx).await;
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn edit_broadcasts_the_updated_snapshot() {
    let (state, _store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(
        &state,
        &chat,
        &room,
        1,
        r#"{"EVENT_TYPE":"private_chat_send_message","receiver_id":2,"message_type":"TEXT","message_text":"hi"}"#,
    )
    .await;
    let ServerEvent::PrivateChatSendMessage { message } = recv_event(&mut alice_rx).await else {
        panic!("expected send event");
    };
    recv_event(&mut bob_rx).await;

    let edit = format!(
        r#"{{"EVENT_TYPE":"private_chat_edit_message","message_id":{},"message_text":"hi there"}}"#,
        message.id
    );
    process_text(&state, &chat, &room, 1, &edit).await;

    let ServerEvent::PrivateChatEditMessage { message: edited } = recv_event(&mut bob_rx).await
    else {
        panic!("expected edit event");
    };
    assert_eq!(edited.content, "hi there");
    assert!(edited.is_edited);
    recv_event(&mut alice_rx).await;
}

#[tokio::test]
async fn delete_broadcasts_once_and_only_for_the_sender() {
    let (state, _store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(
        &state,
        &chat,
        &room,
        1,
        r#"{"EVENT_TYPE":"private_chat_send_message","receiver_id":2,"message_type":"TEXT","message_text":"oops"}"#,
    )
    .await;
    let ServerEvent::PrivateChatSendMessage { message } = recv_event(&mut alice_rx).await else {
        panic!("expected send event");
    };
    recv_event(&mut bob_rx).await;

    let delete =
        format!(r#"{{"EVENT_TYPE":"private_chat_message_delete","message_id":{}}}"#, message.id);

    // Bob is not the sender; the frame is swallowed.
    process_text(&state, &chat, &room, 2, &delete).await;
    assert_no_event(&mut alice_rx).await;
    assert_no_event(&mut bob_rx).await;

    process_text(&state, &chat, &room, 1, &delete).await;
    let ServerEvent::PrivateChatMessageDelete { msg_id } = recv_event(&mut bob_rx).await else {
        panic!("expected delete event");
    };
    assert_eq!(msg_id, message.id);
    recv_event(&mut alice_rx).await;

    // Already deleted: no second event for anyone.
    process_text(&state, &chat, &room, 1, &delete).await;
    assert_no_event(&mut alice_rx).await;
    assert_no_event(&mut bob_rx).await;
}

#[tokio::test]
async fn send_without_membership_is_swallowed() {
    let (state, store) = test_helpers::seeded_state().await;
    store.add_user(carol()).await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    process_text(
        &state,
        &chat,
        &room,
        3,
        r#"{"EVENT_TYPE":"private_chat_send_message","receiver_id":1,"message_type":"TEXT","message_text":"let me in"}"#,
    )
    .await;

    assert_no_event(&mut alice_rx).await;
    assert_no_event(&mut bob_rx).await;
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn presence_query_answers_for_untracked_and_tracked_peers() {
    let (state, _store) = test_helpers::seeded_state().await;
    let (chat, room) = seeded_private_chat(&state).await;
    let (_alice, mut alice_rx, _bob, mut bob_rx) = register_two_sessions(&state, &room).await;

    let ask = r#"{"EVENT_TYPE":"check_private_chat_user_online","user_id":2}"#;
    process_text(&state, &chat, &room, 1, ask).await;

    let ServerEvent::CheckPrivateChatUserOnline { user_id, is_online, last_seen_at } =
        recv_event(&mut alice_rx).await
    else {
        panic!("expected presence event");
    };
    assert_eq!(user_id, 2);
    assert!(!is_online);
    assert_eq!(last_seen_at, None);
    recv_event(&mut bob_rx).await;

    state.presence.set_online(2).await.expect("write-through");
    process_text(&state, &chat, &room, 1, ask).await;
    let ServerEvent::CheckPrivateChatUserOnline { is_online, last_seen_at, .. } =
        recv_event(&mut alice_rx).await
    else {
        panic!("expected presence event");
    };
    assert!(is_online);
    assert!(last_seen_at.is_some());
}

#[tokio::test]
async fn group_chat_fanout_uses_membership_rows() {
    let (state, store) = test_helpers::seeded_state().await;
    store.add_user(carol()).await;
    test_helpers::seed_group_chat(&store, 2, &[1, 2, 3]).await;

    let chat = state.store.chat(2).await.expect("store read").expect("group chat");
    let room = room_key(&chat);
    assert_eq!(room, "group_2");
    let (_alice, mut alice_rx, _carol, mut carol_rx) = register_two_sessions(&state, &room).await;

    // No receiver_id field at all: a group message has no direct recipient.
    process_text(
        &state,
        &chat,
        &room,
        3,
        r#"{"EVENT_TYPE":"private_chat_send_message","message_type":"TEXT","message_text":"hi all"}"#,
    )
    .await;

    let ServerEvent::PrivateChatSendMessage { message } = recv_event(&mut carol_rx).await else {
        panic!("expected send event");
    };
    assert_eq!(message.sender_id, 3);
    assert_eq!(message.recipient_id, None);
    recv_event(&mut alice_rx).await;
}

// =============================================================================
// END TO END
// =============================================================================

async fn spawn_server(state: AppState) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let router = crate::routes::app(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server runs");
    });
    addr
}

async fn recv_json<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_millis(500), socket.next())
            .await
            .expect("socket receive timed out")
            .expect("socket closed unexpectedly")
            .expect("socket read failed");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server sends valid json");
        }
    }
}

#[tokio::test]
async fn ws_session_presence_and_message_flow_end_to_end() {
    let (state, _store) = test_helpers::seeded_state().await;
    let addr = spawn_server(state.clone()).await;

    let (mut alice, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/1?user_id=1"))
            .await
            .expect("alice connects");

    // Alice hears her own online broadcast, handler field included.
    let online = recv_json(&mut alice).await;
    assert_eq!(
        online.get("EVENT_TYPE").and_then(Value::as_str),
        Some("check_private_chat_user_online")
    );
    assert_eq!(online.get("type").and_then(Value::as_str), Some("send_online_offline_event"));
    assert_eq!(online.get("user_id").and_then(Value::as_i64), Some(1));
    assert_eq!(online.get("is_online").and_then(Value::as_bool), Some(true));
    assert_eq!(state.hub.room_size("private_chat_1").await, Some(1));

    let (mut bob, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/1?user_id=2"))
        .await
        .expect("bob connects");
    let bob_online = recv_json(&mut alice).await;
    assert_eq!(bob_online.get("user_id").and_then(Value::as_i64), Some(2));
    recv_json(&mut bob).await;
    assert_eq!(state.hub.room_size("private_chat_1").await, Some(2));

    alice
        .send(tungstenite::Message::Text(
            r#"{"EVENT_TYPE":"private_chat_send_message","receiver_id":2,"message_type":"TEXT","message_text":"hello bob"}"#.into(),
        ))
        .await
        .expect("send frame");

    let delivered = recv_json(&mut bob).await;
    assert_eq!(
        delivered.get("EVENT_TYPE").and_then(Value::as_str),
        Some("private_chat_send_message")
    );
    assert_eq!(delivered.get("type").and_then(Value::as_str), Some("send_private_chat_message"));
    let snapshot = delivered.get("message").expect("message snapshot");
    assert_eq!(snapshot.get("content").and_then(Value::as_str), Some("hello bob"));
    assert_eq!(snapshot.get("is_seen").and_then(Value::as_bool), Some(false));
    let message_id = snapshot.get("id").and_then(Value::as_i64).expect("message id");
    recv_json(&mut alice).await;

    bob.send(tungstenite::Message::Text(
        format!(r#"{{"EVENT_TYPE":"private_chat_see_message","message_id":{message_id}}}"#).into(),
    ))
    .await
    .expect("see frame");

    let seen = recv_json(&mut alice).await;
    assert_eq!(seen.get("EVENT_TYPE").and_then(Value::as_str), Some("private_chat_see_message"));
    assert_eq!(seen.pointer("/message/is_seen").and_then(Value::as_bool), Some(true));
    assert!(seen.pointer("/message/seen_at").and_then(Value::as_i64).is_some());
    recv_json(&mut bob).await;

    // Bob closes; alice hears the offline transition with a last-seen.
    bob.close(None).await.expect("bob closes");
    let offline = recv_json(&mut alice).await;
    assert_eq!(
        offline.get("EVENT_TYPE").and_then(Value::as_str),
        Some("check_private_chat_user_online")
    );
    assert_eq!(offline.get("user_id").and_then(Value::as_i64), Some(2));
    assert_eq!(offline.get("is_online").and_then(Value::as_bool), Some(false));
    assert!(offline.get("last_seen_at").and_then(Value::as_i64).is_some());
    assert_eq!(state.hub.room_size("private_chat_1").await, Some(1));
}

#[tokio::test]
async fn failed_online_write_backs_out_the_whole_connect() {
    let (state, store) = test_helpers::rigged_state().await;
    store.fail_presence_writes(true);
    let addr = spawn_server(state.clone()).await;

    // Authorization reads succeed, so the upgrade completes; the session
    // then dies on the presence write before any broadcast goes out.
    let (mut alice, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/1?user_id=1"))
            .await
            .expect("upgrade completes");

    let ended = timeout(Duration::from_millis(500), async {
        loop {
            match alice.next().await {
                None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server should abort the session");

    assert!(!state.presence.is_online(1).await, "refused connect left the user online");
    assert_eq!(state.hub.room_size("private_chat_1").await, Some(0));
}

#[tokio::test]
async fn offline_broadcast_survives_a_failed_write_through() {
    let (state, store) = test_helpers::rigged_state().await;
    let addr = spawn_server(state.clone()).await;

    let (mut alice, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/1?user_id=1"))
            .await
            .expect("alice connects");
    recv_json(&mut alice).await;

    let (mut bob, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat/1?user_id=2"))
        .await
        .expect("bob connects");
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    store.fail_presence_writes(true);
    bob.close(None).await.expect("bob closes");

    // The row write is refused, but the room still hears the transition.
    let offline = recv_json(&mut alice).await;
    assert_eq!(
        offline.get("EVENT_TYPE").and_then(Value::as_str),
        Some("check_private_chat_user_online")
    );
    assert_eq!(offline.get("user_id").and_then(Value::as_i64), Some(2));
    assert_eq!(offline.get("is_online").and_then(Value::as_bool), Some(false));
    assert!(offline.get("last_seen_at").and_then(Value::as_i64).is_some());
    assert!(!state.presence.is_online(2).await);
}

#[tokio::test]
async fn ws_connect_rejections_use_plain_http_statuses() {
    let (state, store) = test_helpers::seeded_state().await;
    store.add_user(carol()).await;
    let addr = spawn_server(state.clone()).await;

    for (url, expected) in [
        (format!("ws://{addr}/ws/chat/1"), 401),
        (format!("ws://{addr}/ws/chat/404?user_id=1"), 404),
        (format!("ws://{addr}/ws/chat/1?user_id=3"), 403),
    ] {
        match tokio_tungstenite::connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), expected);
            }
            other => panic!("expected http rejection {expected}, got {other:?}"),
        }
    }

    // Rejected connects never touch the hub.
    assert!(state.hub.room_size("private_chat_1").await.is_none());
}
