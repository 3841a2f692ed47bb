use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    chat::require_participant,
    error::AppResult,
    messages::SendMessage,
    models::{ContentType, DeliveryRecord, MessageDto, MessageWithSender, Reaction},
    ratelimit,
    state::AppState,
};

const MESSAGE_DTO_COLUMNS: &str = "m.id, m.chat_id, m.sender_id, m.content, m.content_type, m.metadata, m.reply_to_id, \
     m.is_edited, m.edited_at, m.is_deleted, m.created_at, \
     u.username AS sender_username, u.display_name AS sender_display_name, \
     u.avatar_ref AS sender_avatar_ref";

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub content: String,
    pub content_type: Option<ContentType>,
    pub metadata: Option<Value>,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Cursor: return messages created strictly before the message with this
    /// ID. Resolved server-side to a `(created_at, id)` pair, which gives a
    /// stable total order even when two messages share a timestamp.
    pub before: Option<Uuid>,
    /// Page size (default 50, max 100).
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchMessagesQuery {
    pub q: String,
    pub limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /chats/:id/messages — history, newest first, cursor paged.
///
/// Soft-deleted messages are included: their content is already the
/// `[Deleted]` placeholder and clients render them as tombstones.
pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> AppResult<Json<Vec<MessageDto>>> {
    require_participant(state.db.writer(), chat_id, auth.user_id()).await?;

    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let rows = if let Some(before_id) = query.before {
        sqlx::query_as::<_, MessageWithSender>(&format!(
            "SELECT {MESSAGE_DTO_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = $1
               AND (m.created_at, m.id) < (
                   SELECT created_at, id FROM messages WHERE id = $2
               )
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $3"
        ))
        .bind(chat_id)
        .bind(before_id)
        .bind(limit)
        .fetch_all(state.db.reader())
        .await?
    } else {
        sqlx::query_as::<_, MessageWithSender>(&format!(
            "SELECT {MESSAGE_DTO_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = $1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $2"
        ))
        .bind(chat_id)
        .bind(limit)
        .fetch_all(state.db.reader())
        .await?
    };

    Ok(Json(rows.into_iter().map(MessageDto::from).collect()))
}

/// POST /chats/:id/messages — same path as the socket event, same
/// coordinator, same fan-out.
pub async fn create_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<CreateMessageRequest>,
) -> AppResult<(StatusCode, Json<MessageDto>)> {
    state
        .limiter
        .check(&ratelimit::MESSAGE, &auth.user_id().to_string())
        .await?;

    let message = state
        .coordinator
        .send(SendMessage {
            chat_id,
            sender_id: auth.user_id(),
            content: req.content,
            content_type: req.content_type,
            metadata: req.metadata,
            reply_to_id: req.reply_to_id,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// PUT /messages/:id
pub async fn update_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
    Json(req): Json<UpdateMessageRequest>,
) -> AppResult<Json<MessageDto>> {
    let message = state
        .coordinator
        .edit(auth.user_id(), message_id, &req.content)
        .await?;
    Ok(Json(message))
}

/// DELETE /messages/:id
pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.coordinator.delete(auth.user_id(), message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /messages/:id/read — returns the caller's updated delivery record.
pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<DeliveryRecord>> {
    let record = state
        .coordinator
        .mark_read(auth.user_id(), message_id)
        .await?;
    Ok(Json(record))
}

/// POST /messages/:id/reactions
pub async fn add_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
    Json(req): Json<AddReactionRequest>,
) -> AppResult<(StatusCode, Json<Reaction>)> {
    state
        .limiter
        .check(&ratelimit::REACTION, &auth.user_id().to_string())
        .await?;

    let reaction = state
        .coordinator
        .add_reaction(auth.user_id(), message_id, &req.emoji)
        .await?;

    Ok((StatusCode::CREATED, Json(reaction)))
}

/// DELETE /reactions/:id
pub async fn remove_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(reaction_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state
        .coordinator
        .remove_reaction(auth.user_id(), reaction_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /messages/search?q=... — full-text-ish search across the caller's
/// chats, replica-backed.
pub async fn search_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<SearchMessagesQuery>,
) -> AppResult<Json<Vec<MessageDto>>> {
    state
        .limiter
        .check(&ratelimit::SEARCH, &auth.user_id().to_string())
        .await?;

    let term = query.q.trim();
    if term.is_empty() {
        return Ok(Json(vec![]));
    }
    let limit = query.limit.unwrap_or(25).clamp(1, 100);
    let pattern = format!("%{}%", term.replace('%', "\\%").replace('_', "\\_"));

    let rows = sqlx::query_as::<_, MessageWithSender>(&format!(
        "SELECT {MESSAGE_DTO_COLUMNS}
         FROM messages m
         LEFT JOIN users u ON u.id = m.sender_id
         JOIN participants p ON p.chat_id = m.chat_id
         WHERE p.user_id = $1 AND p.left_at IS NULL
           AND m.is_deleted = FALSE
           AND m.content ILIKE $2
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT $3"
    ))
    .bind(auth.user_id())
    .bind(&pattern)
    .bind(limit)
    .fetch_all(state.db.reader())
    .await?;

    Ok(Json(rows.into_iter().map(MessageDto::from).collect()))
}
