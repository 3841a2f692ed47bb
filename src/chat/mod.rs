use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Chat, Message, Participant};

/// Fetch a non-deleted chat by ID, returning 404 if missing or deleted.
pub async fn fetch_chat(pool: &PgPool, chat_id: Uuid) -> AppResult<Chat> {
    sqlx::query_as::<_, Chat>(
        "SELECT id, chat_type, name, slug, owner_id, last_message_at, is_deleted, created_at
         FROM chats WHERE id = $1 AND is_deleted = FALSE",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Chat not found".into()))
}

/// Fetch a non-deleted message by ID, returning 404 if missing or deleted.
pub async fn fetch_message(pool: &PgPool, message_id: Uuid) -> AppResult<Message> {
    sqlx::query_as::<_, Message>(
        "SELECT id, chat_id, sender_id, content, content_type, metadata, reply_to_id,
                is_edited, edited_at, is_deleted, deleted_at, created_at
         FROM messages WHERE id = $1 AND is_deleted = FALSE",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound("Message not found".into()))
}

/// The uniform authorization predicate: every chat-scoped operation requires
/// the caller to be an active participant (`left_at IS NULL`).
///
/// The error token `NotAParticipant` is surfaced verbatim in socket error
/// payloads.
pub async fn require_participant(
    pool: &PgPool,
    chat_id: Uuid,
    user_id: Uuid,
) -> AppResult<Participant> {
    sqlx::query_as::<_, Participant>(
        "SELECT id, chat_id, user_id, role, unread_count, joined_at, left_at
         FROM participants
         WHERE chat_id = $1 AND user_id = $2 AND left_at IS NULL",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Forbidden("NotAParticipant".into()))
}

/// IDs of every non-deleted chat the user actively participates in. Drives
/// room joins on socket connect.
pub async fn chat_ids_for_user(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar(
        "SELECT p.chat_id FROM participants p
         JOIN chats c ON c.id = p.chat_id
         WHERE p.user_id = $1 AND p.left_at IS NULL AND c.is_deleted = FALSE",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Everyone who shares at least one active chat with the user. Presence
/// updates fan out to exactly this audience.
pub async fn co_participant_ids(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar(
        "SELECT DISTINCT p2.user_id
         FROM participants p1
         JOIN participants p2 ON p1.chat_id = p2.chat_id
         WHERE p1.user_id = $1 AND p2.user_id != $1
           AND p1.left_at IS NULL AND p2.left_at IS NULL",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
