use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::shared::validation_error;
use crate::{
    auth::AuthUser,
    chat::{fetch_chat, require_participant},
    error::{AppError, AppResult},
    models::{Chat, ChatType, ParticipantRole},
    pubsub::CH_CHAT_UPDATE,
    state::AppState,
};

/// Group chats hold at most this many participants (owner included).
const MAX_GROUP_PARTICIPANTS: usize = 300;

const CHAT_COLUMNS: &str =
    "id, chat_type, name, slug, owner_id, last_message_at, is_deleted, created_at";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirectChatRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupChatRequest {
    #[validate(length(min = 1, max = 100, message = "must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 100, message = "must be at most 100 characters"))]
    pub slug: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

/// A chat as listed for one user: the chat row plus that user's unread
/// counter.
#[derive(Debug, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: Uuid,
    pub chat_type: String,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub owner_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub unread_count: i32,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /chats — the caller's active chats, most recently active first.
pub async fn list_chats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<ChatSummary>>> {
    let chats = sqlx::query_as::<_, ChatSummary>(
        "SELECT c.id, c.chat_type, c.name, c.slug, c.owner_id, c.last_message_at,
                c.created_at, p.unread_count
         FROM chats c
         JOIN participants p ON p.chat_id = c.id
         WHERE p.user_id = $1 AND p.left_at IS NULL AND c.is_deleted = FALSE
         ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC",
    )
    .bind(auth.user_id())
    .fetch_all(state.db.writer())
    .await?;

    Ok(Json(chats))
}

/// GET /chats/:id
pub async fn get_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<Chat>> {
    require_participant(state.db.writer(), chat_id, auth.user_id()).await?;
    let chat = fetch_chat(state.db.writer(), chat_id).await?;
    Ok(Json(chat))
}

/// POST /chats/direct — open (or return) the direct chat with another user.
///
/// Direct chats are unique per pair and always hold exactly two active
/// participants.
pub async fn create_direct_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateDirectChatRequest>,
) -> AppResult<(StatusCode, Json<Chat>)> {
    if req.user_id == auth.user_id() {
        return Err(AppError::BadRequest(
            "Cannot open a direct chat with yourself".into(),
        ));
    }

    let peer_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_deleted = FALSE)",
    )
    .bind(req.user_id)
    .fetch_one(state.db.writer())
    .await?;
    if !peer_exists {
        return Err(AppError::NotFound("User not found".into()));
    }

    // Reuse the existing direct chat for this pair if there is one.
    let existing = sqlx::query_as::<_, Chat>(&format!(
        "SELECT {CHAT_COLUMNS} FROM chats c
         WHERE c.chat_type = 'direct' AND c.is_deleted = FALSE
           AND EXISTS(SELECT 1 FROM participants
                      WHERE chat_id = c.id AND user_id = $1 AND left_at IS NULL)
           AND EXISTS(SELECT 1 FROM participants
                      WHERE chat_id = c.id AND user_id = $2 AND left_at IS NULL)"
    ))
    .bind(auth.user_id())
    .bind(req.user_id)
    .fetch_optional(state.db.writer())
    .await?;

    if let Some(chat) = existing {
        return Ok((StatusCode::OK, Json(chat)));
    }

    let mut tx = state.db.writer().begin().await?;

    let chat = sqlx::query_as::<_, Chat>(&format!(
        "INSERT INTO chats (chat_type) VALUES ('direct') RETURNING {CHAT_COLUMNS}"
    ))
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO participants (chat_id, user_id, role)
         SELECT $1, unnest($2::uuid[]), 'member'",
    )
    .bind(chat.id)
    .bind(vec![auth.user_id(), req.user_id])
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    publish_membership(&state, chat.id, "joined", &[auth.user_id(), req.user_id]).await;

    Ok((StatusCode::CREATED, Json(chat)))
}

/// POST /chats/group
pub async fn create_group_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateGroupChatRequest>,
) -> AppResult<(StatusCode, Json<Chat>)> {
    req.validate().map_err(validation_error)?;

    let mut members: Vec<Uuid> = req
        .participant_ids
        .into_iter()
        .filter(|id| *id != auth.user_id())
        .collect();
    members.sort_unstable();
    members.dedup();

    if members.len() + 1 > MAX_GROUP_PARTICIPANTS {
        return Err(AppError::BadRequest(format!(
            "Group chats hold at most {MAX_GROUP_PARTICIPANTS} participants"
        )));
    }

    let mut tx = state.db.writer().begin().await?;

    let chat = sqlx::query_as::<_, Chat>(&format!(
        "INSERT INTO chats (chat_type, name, slug, owner_id)
         VALUES ('group', $1, $2, $3)
         RETURNING {CHAT_COLUMNS}"
    ))
    .bind(&req.name)
    .bind(&req.slug)
    .bind(auth.user_id())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO participants (chat_id, user_id, role) VALUES ($1, $2, 'owner')")
        .bind(chat.id)
        .bind(auth.user_id())
        .execute(&mut *tx)
        .await?;

    if !members.is_empty() {
        sqlx::query(
            "INSERT INTO participants (chat_id, user_id, role)
             SELECT $1, unnest($2::uuid[]), 'member'",
        )
        .bind(chat.id)
        .bind(&members)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    let mut everyone = members;
    everyone.push(auth.user_id());
    publish_membership(&state, chat.id, "joined", &everyone).await;

    Ok((StatusCode::CREATED, Json(chat)))
}

/// POST /chats/:id/participants — group chats only, owner or admin.
pub async fn add_participant(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<AddParticipantRequest>,
) -> AppResult<StatusCode> {
    let chat = fetch_chat(state.db.writer(), chat_id).await?;
    if chat.chat_type != ChatType::Group.to_string() {
        return Err(AppError::BadRequest(
            "Participants of a direct chat are fixed".into(),
        ));
    }

    let caller = require_participant(state.db.writer(), chat_id, auth.user_id()).await?;
    if caller.role != ParticipantRole::Owner.to_string()
        && caller.role != ParticipantRole::Admin.to_string()
    {
        return Err(AppError::Forbidden(
            "Only the owner or an admin can add participants".into(),
        ));
    }

    let active: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM participants WHERE chat_id = $1 AND left_at IS NULL")
            .bind(chat_id)
            .fetch_one(state.db.writer())
            .await?;
    if active as usize >= MAX_GROUP_PARTICIPANTS {
        return Err(AppError::BadRequest(format!(
            "Group chats hold at most {MAX_GROUP_PARTICIPANTS} participants"
        )));
    }

    // Re-activate a former participant instead of duplicating the row; the
    // partial unique index forbids two active rows per (chat, user).
    let rejoined = sqlx::query(
        "UPDATE participants SET left_at = NULL, joined_at = NOW(), unread_count = 0
         WHERE chat_id = $1 AND user_id = $2 AND left_at IS NOT NULL",
    )
    .bind(chat_id)
    .bind(req.user_id)
    .execute(state.db.writer())
    .await?;

    if rejoined.rows_affected() == 0 {
        let already_active: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM participants
                           WHERE chat_id = $1 AND user_id = $2 AND left_at IS NULL)",
        )
        .bind(chat_id)
        .bind(req.user_id)
        .fetch_one(state.db.writer())
        .await?;
        if already_active {
            return Err(AppError::Conflict("Already a participant".into()));
        }

        sqlx::query("INSERT INTO participants (chat_id, user_id, role) VALUES ($1, $2, 'member')")
            .bind(chat_id)
            .bind(req.user_id)
            .execute(state.db.writer())
            .await?;
    }

    publish_membership(&state, chat_id, "joined", &[req.user_id]).await;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /chats/:id/participants/:user_id — owner/admin removal.
pub async fn remove_participant(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((chat_id, user_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let chat = fetch_chat(state.db.writer(), chat_id).await?;
    if chat.chat_type != ChatType::Group.to_string() {
        return Err(AppError::BadRequest(
            "Participants of a direct chat are fixed".into(),
        ));
    }

    let caller = require_participant(state.db.writer(), chat_id, auth.user_id()).await?;
    if caller.role != ParticipantRole::Owner.to_string()
        && caller.role != ParticipantRole::Admin.to_string()
    {
        return Err(AppError::Forbidden(
            "Only the owner or an admin can remove participants".into(),
        ));
    }
    if chat.owner_id == Some(user_id) {
        return Err(AppError::Forbidden("The owner cannot be removed".into()));
    }

    deactivate_participant(&state, chat_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /chats/:id/leave — leave a group chat voluntarily.
pub async fn leave_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let chat = fetch_chat(state.db.writer(), chat_id).await?;
    if chat.chat_type != ChatType::Group.to_string() {
        return Err(AppError::BadRequest("Cannot leave a direct chat".into()));
    }
    if chat.owner_id == Some(auth.user_id()) {
        return Err(AppError::BadRequest(
            "The owner cannot leave their own group".into(),
        ));
    }

    require_participant(state.db.writer(), chat_id, auth.user_id()).await?;
    deactivate_participant(&state, chat_id, auth.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Helpers
// ============================================================================

async fn deactivate_participant(state: &AppState, chat_id: Uuid, user_id: Uuid) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE participants SET left_at = NOW()
         WHERE chat_id = $1 AND user_id = $2 AND left_at IS NULL",
    )
    .bind(chat_id)
    .bind(user_id)
    .execute(state.db.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Participant not found".into()));
    }

    publish_membership(state, chat_id, "left", &[user_id]).await;
    Ok(())
}

/// Tell the fleet about a membership change; every node (this one included)
/// resyncs its rooms from the subscriber.
async fn publish_membership(state: &AppState, chat_id: Uuid, action: &str, user_ids: &[Uuid]) {
    state
        .bus
        .publish(
            CH_CHAT_UPDATE,
            json!({
                "chatId": chat_id,
                "action": action,
                "userIds": user_ids,
            }),
        )
        .await;
}
