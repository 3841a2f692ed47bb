use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{Contact, ContactStatus},
    ratelimit,
    state::AppState,
};

const CONTACT_COLUMNS: &str =
    "id, user_id, contact_id, status, requested_by, created_at, accepted_at";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestBody {
    pub user_id: Uuid,
}

/// GET /contacts — both directions of the relationship.
pub async fn list_contacts(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<Contact>>> {
    let contacts = sqlx::query_as::<_, Contact>(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE user_id = $1 OR contact_id = $1
         ORDER BY created_at DESC"
    ))
    .bind(auth.user_id())
    .fetch_all(state.db.writer())
    .await?;

    Ok(Json(contacts))
}

/// POST /contacts/request
pub async fn request_contact(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<ContactRequestBody>,
) -> AppResult<(StatusCode, Json<Contact>)> {
    state
        .limiter
        .check(&ratelimit::CONTACT_REQUEST, &auth.user_id().to_string())
        .await?;

    if req.user_id == auth.user_id() {
        return Err(AppError::BadRequest("Cannot add yourself as a contact".into()));
    }

    let target_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_deleted = FALSE)",
    )
    .bind(req.user_id)
    .fetch_one(state.db.writer())
    .await?;
    if !target_exists {
        return Err(AppError::NotFound("User not found".into()));
    }

    // One relationship row per pair, whichever side initiated it.
    let existing = sqlx::query_as::<_, Contact>(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts
         WHERE (user_id = $1 AND contact_id = $2) OR (user_id = $2 AND contact_id = $1)"
    ))
    .bind(auth.user_id())
    .bind(req.user_id)
    .fetch_optional(state.db.writer())
    .await?;

    if let Some(contact) = existing {
        return if contact.status == ContactStatus::Blocked.to_string() {
            Err(AppError::Forbidden("Contact is blocked".into()))
        } else {
            Err(AppError::Conflict("Contact request already exists".into()))
        };
    }

    let contact = sqlx::query_as::<_, Contact>(&format!(
        "INSERT INTO contacts (user_id, contact_id, status, requested_by)
         VALUES ($1, $2, 'pending', $1)
         RETURNING {CONTACT_COLUMNS}"
    ))
    .bind(auth.user_id())
    .bind(req.user_id)
    .fetch_one(state.db.writer())
    .await?;

    Ok((StatusCode::CREATED, Json(contact)))
}

/// POST /contacts/:id/accept — only the requested side may accept.
pub async fn accept_contact(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(contact_row_id): Path<Uuid>,
) -> AppResult<Json<Contact>> {
    let contact = sqlx::query_as::<_, Contact>(&format!(
        "UPDATE contacts SET status = 'accepted', accepted_at = NOW()
         WHERE id = $1 AND status = 'pending' AND requested_by != $2
           AND (user_id = $2 OR contact_id = $2)
         RETURNING {CONTACT_COLUMNS}"
    ))
    .bind(contact_row_id)
    .bind(auth.user_id())
    .fetch_optional(state.db.writer())
    .await?
    .ok_or_else(|| AppError::NotFound("Contact request not found".into()))?;

    Ok(Json(contact))
}

/// POST /contacts/:id/reject — the requested side declines; the row is
/// removed so the pair can try again later.
pub async fn reject_contact(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(contact_row_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let result = sqlx::query(
        "DELETE FROM contacts
         WHERE id = $1 AND status = 'pending' AND requested_by != $2
           AND (user_id = $2 OR contact_id = $2)",
    )
    .bind(contact_row_id)
    .bind(auth.user_id())
    .execute(state.db.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Contact request not found".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /contacts/:id — either side removes an established contact.
pub async fn remove_contact(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(contact_row_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let result = sqlx::query(
        "DELETE FROM contacts WHERE id = $1 AND (user_id = $2 OR contact_id = $2)",
    )
    .bind(contact_row_id)
    .bind(auth.user_id())
    .execute(state.db.writer())
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Contact not found".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}
