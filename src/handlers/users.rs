use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::shared::validation_error;
use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{User, UserDto},
    ratelimit,
    state::AppState,
};

const USER_COLUMNS: &str = "id, username, display_name, password_hash, avatar_ref, status, \
     last_seen, is_deleted, created_at, updated_at";

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMeRequest {
    #[validate(length(min = 1, max = 100, message = "must be 1-100 characters"))]
    pub display_name: Option<String>,
    #[validate(length(max = 500, message = "must be at most 500 characters"))]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

/// GET /users/me
pub async fn get_me(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<UserDto>> {
    let user = fetch_user(&state, auth.user_id()).await?;
    Ok(Json(user.into()))
}

/// PUT /users/me — profile fields only; presence status flows through the
/// socket, not this endpoint.
pub async fn update_me(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<UpdateMeRequest>,
) -> AppResult<Json<UserDto>> {
    req.validate().map_err(validation_error)?;

    let user = sqlx::query_as::<_, User>(&format!(
        "UPDATE users
         SET display_name = COALESCE($2, display_name),
             avatar_ref = COALESCE($3, avatar_ref),
             updated_at = NOW()
         WHERE id = $1 AND is_deleted = FALSE
         RETURNING {USER_COLUMNS}"
    ))
    .bind(auth.user_id())
    .bind(&req.display_name)
    .bind(&req.avatar_ref)
    .fetch_optional(state.db.writer())
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    Ok(Json(user.into()))
}

/// GET /users/:id
pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<UserDto>> {
    let user = fetch_user(&state, user_id).await?;
    Ok(Json(user.into()))
}

/// GET /users/search?q=... — prefix/substring match on username and display
/// name. Reads the replica; slightly stale results are fine here.
pub async fn search_users(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<UserDto>>> {
    state
        .limiter
        .check(&ratelimit::SEARCH, &auth.user_id().to_string())
        .await?;

    let term = query.q.trim();
    if term.is_empty() {
        return Ok(Json(vec![]));
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 50);
    let pattern = format!("%{}%", term.replace('%', "\\%").replace('_', "\\_"));

    let users = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users
         WHERE is_deleted = FALSE
           AND (username ILIKE $1 OR display_name ILIKE $1)
         ORDER BY username ASC
         LIMIT $2"
    ))
    .bind(&pattern)
    .bind(limit)
    .fetch_all(state.db.reader())
    .await?;

    Ok(Json(users.into_iter().map(UserDto::from).collect()))
}

async fn fetch_user(state: &AppState, user_id: Uuid) -> AppResult<User> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND is_deleted = FALSE"
    ))
    .bind(user_id)
    .fetch_optional(state.db.writer())
    .await?
    .ok_or_else(|| AppError::NotFound("User not found".into()))
}
