use std::borrow::Cow;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use chrono::Utc;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use super::events::{
    AuthFrame, ChatRefPayload, EditPayload, Envelope, MessageRefPayload, PresenceUpdatePayload,
    ReactionAddPayload, ReactionRemovePayload, SendPayload, EV_CHAT_MARK_ALL_READ,
    EV_CONNECTION_SUCCESS, EV_MESSAGE_DELETE, EV_MESSAGE_EDIT, EV_MESSAGE_ERROR, EV_MESSAGE_NEW,
    EV_MESSAGE_READ, EV_MESSAGE_SEND, EV_MESSAGE_SENT, EV_PRESENCE_HEARTBEAT, EV_PRESENCE_UPDATE,
    EV_REACTION_ADD, EV_REACTION_ERROR, EV_REACTION_REMOVE, EV_TYPING_START, EV_TYPING_STOP,
};
use crate::{
    auth::{validate_token, Claims, TokenType},
    chat::{chat_ids_for_user, require_participant},
    error::AppError,
    messages::SendMessage,
    ratelimit,
    state::AppState,
};

/// `1008 Policy` — invalid or expired credential.
const CLOSE_POLICY: u16 = 1008;
/// `1011 Internal` — server-side failure during the handshake.
const CLOSE_INTERNAL: u16 = 1011;

/// Deadline for writing one frame; a socket that cannot take a frame within
/// this window is closed.
const SEND_DEADLINE: Duration = Duration::from_secs(10);

/// How long a handshake may wait for the auth frame when no query token was
/// given.
const AUTH_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Query params
// ============================================================================

/// The access token is accepted as a query parameter because WebSocket
/// upgrade requests are plain GETs and cannot reliably carry an Authorization
/// header. Clients that avoid token-in-URL send it in the first frame as
/// `{"auth": {"token": "..."}}` instead.
#[derive(Debug, serde::Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

// ============================================================================
// Upgrade handler
// ============================================================================

/// GET /ws — upgrade to a socket connection.
///
/// Authentication happens after the upgrade so rejections can use the
/// protocol's close codes (`1008` policy, `1011` internal) with a reason the
/// client can branch on (expired vs invalid).
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.token, state))
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn handle_socket(socket: WebSocket, query_token: Option<String>, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let claims = match authenticate(query_token, &mut ws_receiver, &state).await {
        Ok(claims) => claims,
        Err(close) => {
            let _ = ws_sender.send(Message::Close(Some(close))).await;
            return;
        }
    };

    let user_id = match claims.user_id() {
        Ok(id) => id,
        Err(_) => {
            let _ = ws_sender
                .send(Message::Close(Some(policy_close("Invalid token subject"))))
                .await;
            return;
        }
    };

    let socket_id = Uuid::new_v4();

    // Bind the socket to its session; a logged-out session cannot hold one.
    if let Err(e) = state.sessions.attach_socket(claims.sid, socket_id).await {
        let close = match e {
            AppError::Unauthorized(_) => policy_close("Invalid session"),
            _ => CloseFrame {
                code: CLOSE_INTERNAL,
                reason: Cow::from("Internal error"),
            },
        };
        let _ = ws_sender.send(Message::Close(Some(close))).await;
        return;
    }

    let mut rx = state.sockets.register(socket_id, user_id).await;

    // Writer task: drains the outbound channel with a per-frame deadline.
    let mut send_task = tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            match tokio::time::timeout(SEND_DEADLINE, ws_sender.send(Message::Text(raw))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!("Socket writer missed the send deadline; closing");
                    break;
                }
            }
        }
    });

    if let Err(e) = state.presence.attach(user_id, socket_id).await {
        tracing::warn!(user_id = %user_id, error = ?e, "Presence attach failed");
    }

    // Join the rooms of every chat the user actively participates in.
    match chat_ids_for_user(state.db.writer(), user_id).await {
        Ok(chat_ids) => {
            for chat_id in chat_ids {
                state.sockets.join_room(chat_id, socket_id).await;
            }
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = ?e, "Failed to load chats for room join");
        }
    }

    state
        .sockets
        .emit_to_socket(
            socket_id,
            EV_CONNECTION_SUCCESS,
            json!({ "userId": user_id, "timestamp": Utc::now() }),
        )
        .await;

    // Push messages that arrived while this user was unreachable, oldest
    // first, before the socket is considered ready.
    match state.coordinator.flush_undelivered(user_id).await {
        Ok(backlog) => {
            for message in backlog {
                let payload = serde_json::to_value(&message).unwrap_or_else(|_| json!({}));
                state
                    .sockets
                    .emit_to_socket(socket_id, EV_MESSAGE_NEW, payload)
                    .await;
            }
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = ?e, "Undelivered flush failed");
        }
    }

    // Reader task: inbound events are handled one at a time, so a single
    // client can never interleave its own events out of order.
    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    handle_frame(socket_id, user_id, &text, &state_clone).await;
                }
                Ok(Message::Close(_)) => break,
                // Ping/Pong are handled by the underlying library.
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(user_id = %user_id, error = ?e, "Socket receive error");
                    break;
                }
            }
        }
    });

    // Either half finishing tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Disconnect: committed work stays committed; only liveness state is
    // unwound.
    state.sockets.unregister(socket_id).await;
    if let Err(e) = state.sessions.detach_socket(claims.sid, socket_id).await {
        tracing::debug!(user_id = %user_id, error = ?e, "Session detach failed");
    }
    if let Err(e) = state.presence.detach(user_id, socket_id).await {
        tracing::warn!(user_id = %user_id, error = ?e, "Presence detach failed");
    }
}

// ============================================================================
// Handshake
// ============================================================================

fn policy_close(reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CLOSE_POLICY,
        reason: Cow::from(reason),
    }
}

/// Resolve the access credential from the query parameter or, failing that,
/// from an `{"auth": {"token"}}` frame sent within the handshake window.
async fn authenticate(
    query_token: Option<String>,
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<Claims, CloseFrame<'static>> {
    let token = match query_token {
        Some(token) => token,
        None => await_auth_frame(ws_receiver).await?,
    };

    validate_token(&token, &state.config.access_token_secret, TokenType::Access)
        .map_err(|e| policy_close(e.reason()))
}

async fn await_auth_frame(
    ws_receiver: &mut SplitStream<WebSocket>,
) -> Result<String, CloseFrame<'static>> {
    let deadline = tokio::time::timeout(AUTH_FRAME_TIMEOUT, ws_receiver.next());

    match deadline.await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AuthFrame>(&text)
            .map(|frame| frame.auth.token)
            .map_err(|_| policy_close("Missing credentials")),
        Ok(_) => Err(policy_close("Missing credentials")),
        Err(_) => Err(policy_close("Handshake timed out")),
    }
}

// ============================================================================
// Inbound dispatch
// ============================================================================

/// Build the uniform `*:error` payload for a failed socket operation.
fn socket_error(err: &AppError) -> Value {
    let mut payload = json!({ "error": err.socket_code() });
    if let AppError::RateLimited { retry_after_ms } = err {
        payload["retryAfter"] = json!(retry_after_ms);
    }
    payload
}

/// Process one text frame. Malformed frames are ignored rather than fatal —
/// a buggy client does not get to kill its own connection.
async fn handle_frame(socket_id: Uuid, user_id: Uuid, text: &str, state: &AppState) {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return;
    };

    match envelope.event.as_str() {
        EV_MESSAGE_SEND => handle_send(socket_id, user_id, envelope.data, state).await,
        EV_MESSAGE_EDIT => handle_edit(socket_id, user_id, envelope.data, state).await,
        EV_MESSAGE_DELETE => handle_delete(socket_id, user_id, envelope.data, state).await,
        EV_MESSAGE_READ => handle_read(socket_id, user_id, envelope.data, state).await,
        EV_CHAT_MARK_ALL_READ => handle_mark_all_read(socket_id, user_id, envelope.data, state).await,
        EV_REACTION_ADD => handle_reaction_add(socket_id, user_id, envelope.data, state).await,
        EV_REACTION_REMOVE => handle_reaction_remove(socket_id, user_id, envelope.data, state).await,
        EV_TYPING_START | EV_TYPING_STOP => {
            handle_typing(user_id, &envelope.event, envelope.data, state).await
        }
        EV_PRESENCE_UPDATE => handle_presence_update(user_id, envelope.data, state).await,
        EV_PRESENCE_HEARTBEAT => {
            if let Err(e) = state.presence.heartbeat(user_id, socket_id).await {
                tracing::debug!(user_id = %user_id, error = ?e, "Heartbeat refresh failed");
            }
        }
        // "auth" after the handshake, unknown events: ignore.
        _ => {}
    }
}

async fn handle_send(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<SendPayload>(data) else {
        return;
    };
    let chat_id = payload.chat_id;

    let result = async {
        state
            .limiter
            .check(&ratelimit::MESSAGE, &user_id.to_string())
            .await?;

        state
            .coordinator
            .send(SendMessage {
                chat_id,
                sender_id: user_id,
                content: payload.content,
                content_type: payload.content_type,
                metadata: payload.metadata,
                reply_to_id: payload.reply_to_id,
            })
            .await
    }
    .await;

    match result {
        Ok(message) => {
            // Out-of-band ack; recipients get `message:new` via the room.
            state
                .sockets
                .emit_to_socket(
                    socket_id,
                    EV_MESSAGE_SENT,
                    json!({
                        "messageId": message.id,
                        "chatId": chat_id,
                        "timestamp": message.created_at,
                    }),
                )
                .await;
        }
        Err(e) => {
            let mut payload = socket_error(&e);
            payload["chatId"] = json!(chat_id);
            state
                .sockets
                .emit_to_socket(socket_id, EV_MESSAGE_ERROR, payload)
                .await;
        }
    }
}

async fn handle_edit(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<EditPayload>(data) else {
        return;
    };

    if let Err(e) = state
        .coordinator
        .edit(user_id, payload.message_id, &payload.content)
        .await
    {
        let mut body = socket_error(&e);
        body["messageId"] = json!(payload.message_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_MESSAGE_ERROR, body)
            .await;
    }
}

async fn handle_delete(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<MessageRefPayload>(data) else {
        return;
    };

    if let Err(e) = state.coordinator.delete(user_id, payload.message_id).await {
        let mut body = socket_error(&e);
        body["messageId"] = json!(payload.message_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_MESSAGE_ERROR, body)
            .await;
    }
}

async fn handle_read(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<MessageRefPayload>(data) else {
        return;
    };

    if let Err(e) = state.coordinator.mark_read(user_id, payload.message_id).await {
        let mut body = socket_error(&e);
        body["messageId"] = json!(payload.message_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_MESSAGE_ERROR, body)
            .await;
    }
}

async fn handle_mark_all_read(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<ChatRefPayload>(data) else {
        return;
    };

    if let Err(e) = state
        .coordinator
        .mark_all_read(user_id, payload.chat_id)
        .await
    {
        let mut body = socket_error(&e);
        body["chatId"] = json!(payload.chat_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_MESSAGE_ERROR, body)
            .await;
    }
}

async fn handle_reaction_add(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<ReactionAddPayload>(data) else {
        return;
    };

    let result = async {
        state
            .limiter
            .check(&ratelimit::REACTION, &user_id.to_string())
            .await?;
        state
            .coordinator
            .add_reaction(user_id, payload.message_id, &payload.emoji)
            .await
    }
    .await;

    if let Err(e) = result {
        let mut body = socket_error(&e);
        body["messageId"] = json!(payload.message_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_REACTION_ERROR, body)
            .await;
    }
}

async fn handle_reaction_remove(socket_id: Uuid, user_id: Uuid, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<ReactionRemovePayload>(data) else {
        return;
    };

    let result = async {
        state
            .limiter
            .check(&ratelimit::REACTION, &user_id.to_string())
            .await?;
        state
            .coordinator
            .remove_reaction(user_id, payload.reaction_id)
            .await
    }
    .await;

    if let Err(e) = result {
        let mut body = socket_error(&e);
        body["reactionId"] = json!(payload.reaction_id);
        state
            .sockets
            .emit_to_socket(socket_id, EV_REACTION_ERROR, body)
            .await;
    }
}

async fn handle_typing(user_id: Uuid, event: &str, data: Value, state: &AppState) {
    let Ok(payload) = serde_json::from_value::<ChatRefPayload>(data) else {
        return;
    };

    // Typing is chat-scoped, so the uniform participant predicate applies;
    // failures are silent because the flag is best-effort.
    if require_participant(state.db.writer(), payload.chat_id, user_id)
        .await
        .is_err()
    {
        return;
    }

    let result = if event == EV_TYPING_START {
        state.typing.start(payload.chat_id, user_id).await
    } else {
        state.typing.stop(payload.chat_id, user_id).await
    };

    if let Err(e) = result {
        tracing::debug!(user_id = %user_id, error = ?e, "Typing update failed");
    }
}

async fn handle_presence_update(user_id: Uuid, data: Value, state: &AppState) {
    // Unknown status values fail the parse and are ignored.
    let Ok(payload) = serde_json::from_value::<PresenceUpdatePayload>(data) else {
        return;
    };

    if let Err(e) = state.presence.set_status(user_id, payload.status).await {
        tracing::debug!(user_id = %user_id, error = ?e, "Presence update failed");
    }
}
