use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::shared::{validation_error, USERNAME_RE};
use crate::{
    auth::{
        create_access_token, create_refresh_token, hash_password, hash_session_token,
        validate_token, verify_password, AuthUser, TokenType,
    },
    error::{AppError, AppResult, FieldError},
    models::{DeviceInfo, User, UserDto},
    ratelimit,
    state::AppState,
};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    #[validate(length(min = 8, message = "must be at least 8 characters"))]
    pub password: String,
    #[validate(length(max = 100, message = "must be at most 100 characters"))]
    pub display_name: Option<String>,
    #[serde(default)]
    pub device: DeviceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device: DeviceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    /// When set, every session of the user is terminated.
    #[serde(default)]
    pub everywhere: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}

// ============================================================================
// Helpers
// ============================================================================

const USER_COLUMNS: &str = "id, username, display_name, password_hash, avatar_ref, status, \
     last_seen, is_deleted, created_at, updated_at";

/// Mint the token pair and persist the session row.
///
/// The session ID is generated first so both credentials can carry it as the
/// `sid` claim; the stored session token is the digest of the refresh
/// credential.
async fn issue_session(
    state: &AppState,
    user: &User,
    device: &DeviceInfo,
) -> AppResult<(String, String)> {
    let session_id = Uuid::new_v4();

    let refresh_token = create_refresh_token(
        user.id,
        user.username.clone(),
        session_id,
        &state.config.refresh_token_secret,
    )?;
    let access_token = create_access_token(
        user.id,
        user.username.clone(),
        session_id,
        &state.config.access_token_secret,
    )?;

    let digest = hash_session_token(&refresh_token);
    state
        .sessions
        .create(session_id, user.id, &digest, device)
        .await?;

    Ok((access_token, refresh_token))
}

fn username_field_error() -> AppError {
    AppError::Validation(vec![FieldError {
        field: "username".into(),
        message: "must be 3-50 characters of letters, digits or underscore".into(),
    }])
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /auth/register
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    state
        .limiter
        .check(&ratelimit::AUTH, &addr.ip().to_string())
        .await?;

    req.validate().map_err(validation_error)?;
    if !USERNAME_RE.is_match(&req.username) {
        return Err(username_field_error());
    }

    let password_hash = hash_password(&req.password)?;
    let display_name = req
        .display_name
        .clone()
        .unwrap_or_else(|| req.username.clone());

    // The unique index is the real guard; the insert maps 23505 to Conflict.
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (username, display_name, password_hash, status)
         VALUES ($1, $2, $3, 'offline')
         RETURNING {USER_COLUMNS}"
    ))
    .bind(&req.username)
    .bind(&display_name)
    .bind(&password_hash)
    .fetch_one(state.db.writer())
    .await?;

    info!(user_id = %user.id, username = %user.username, "User registered");

    let mut device = req.device;
    device.ip_address = Some(addr.ip().to_string());
    let (access_token, refresh_token) = issue_session(&state, &user, &device).await?;

    // Registration counts as a successful auth; clear the counter.
    let _ = state
        .limiter
        .forget(&ratelimit::AUTH, &addr.ip().to_string())
        .await;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            refresh_token,
            user: user.into(),
        }),
    ))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let ip = addr.ip().to_string();
    state.limiter.check(&ratelimit::AUTH, &ip).await?;

    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND is_deleted = FALSE"
    ))
    .bind(&req.username)
    .fetch_optional(state.db.writer())
    .await?
    .ok_or_else(|| AppError::Unauthorized("Invalid username or password".into()))?;

    if !verify_password(&req.password, &user.password_hash)? {
        return Err(AppError::Unauthorized(
            "Invalid username or password".into(),
        ));
    }

    info!(user_id = %user.id, username = %user.username, "Login successful");

    let mut device = req.device;
    device.ip_address = Some(ip.clone());
    let (access_token, refresh_token) = issue_session(&state, &user, &device).await?;

    // Successful attempts do not count against the auth bucket.
    let _ = state.limiter.forget(&ratelimit::AUTH, &ip).await;

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: user.into(),
    }))
}

/// POST /auth/refresh — trade a refresh credential for a fresh access token.
///
/// The session row is the revocation authority: a structurally valid refresh
/// token whose session was invalidated is rejected.
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<RefreshResponse>> {
    let claims = validate_token(
        &req.refresh_token,
        &state.config.refresh_token_secret,
        TokenType::Refresh,
    )?;
    let user_id = claims.user_id()?;

    let digest = hash_session_token(&req.refresh_token);
    let session = state.sessions.find_by_token(&digest).await?;
    if session.user_id != user_id {
        return Err(AppError::Unauthorized("Invalid session".into()));
    }

    state.sessions.touch(&digest).await?;

    let access_token = create_access_token(
        user_id,
        claims.username,
        session.id,
        &state.config.access_token_secret,
    )?;

    Ok(Json(RefreshResponse { access_token }))
}

/// POST /auth/logout — terminate the calling session, or all of the user's
/// sessions with `{"everywhere": true}`.
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Option<Json<LogoutRequest>>,
) -> AppResult<StatusCode> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    if req.everywhere {
        let count = state
            .sessions
            .invalidate_all_for_user(auth.user_id())
            .await?;
        info!(user_id = %auth.user_id(), sessions = count, "Logged out everywhere");
    } else {
        state.sessions.invalidate_by_id(auth.session_id()).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
