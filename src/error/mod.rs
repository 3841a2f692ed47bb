use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// One field-level validation failure, surfaced in the `details` array of a
/// 422 response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Rate limited")]
    RateLimited { retry_after_ms: u64 },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("KV store error: {0}")]
    Kv(redis::RedisError),

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    /// Machine-readable error code, stable across the HTTP and socket
    /// surfaces. Socket handlers put this in `*:error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BadRequest",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Forbidden(_) => "Forbidden",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::Validation(_) => "Validation",
            AppError::RateLimited { .. } => "RateLimited",
            // Infrastructure failures surface as ServiceUnavailable; the
            // cause is logged, never sent to the client.
            AppError::Database(_) | AppError::Kv(_) => "ServiceUnavailable",
            AppError::Internal => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) | AppError::Kv(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error token for socket `*:error` payloads.
    ///
    /// Domain rejections carry a single PascalCase token as their message
    /// (`NotAParticipant`, `ContentTooLarge`); those are surfaced verbatim so
    /// clients can branch on them. Everything else falls back to the kind
    /// code.
    pub fn socket_code(&self) -> String {
        match self {
            AppError::Forbidden(msg) | AppError::BadRequest(msg)
                if !msg.is_empty() && msg.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                msg.clone()
            }
            other => other.code().to_string(),
        }
    }

    /// Message safe to return to the caller. Caller-input errors are
    /// reported verbatim; infrastructure and unknown errors are scrubbed.
    fn client_message(&self) -> String {
        match self {
            AppError::BadRequest(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::Validation(_) => "Validation failed".into(),
            AppError::RateLimited { .. } => "Too many requests".into(),
            AppError::Database(_) | AppError::Kv(_) => "Service temporarily unavailable".into(),
            AppError::Internal => "Internal server error".into(),
        }
    }
}

/// Map sqlx errors to AppError, with special handling for unique-constraint
/// violations (PG error code 23505) so they surface as 409 Conflict rather
/// than 503.
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.code().as_deref() == Some("23505") {
                let message = match db_err.constraint() {
                    Some(c) if c.contains("username") => "Username already taken",
                    Some(c) if c.contains("slug") => "Slug already taken",
                    _ => "Resource already exists",
                };
                return AppError::Conflict(message.into());
            }
        }
        AppError::Database(e)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Kv(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "Database error");
            }
            AppError::Kv(e) => {
                tracing::error!(error = ?e, "KV store error");
            }
            AppError::Internal => {
                tracing::error!("Internal server error");
            }
            _ => {}
        }

        let status = self.status();
        let mut body = json!({
            "error": self.code(),
            "message": self.client_message(),
            "statusCode": status.as_u16(),
        });

        match &self {
            AppError::Validation(fields) => {
                body["details"] = json!(fields);
            }
            AppError::RateLimited { retry_after_ms } => {
                body["details"] = json!({ "retryAfter": retry_after_ms });
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_returns_401() {
        let response = AppError::Unauthorized("expired token".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_request_returns_400() {
        let response = AppError::BadRequest("empty content".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn forbidden_returns_403() {
        let response = AppError::Forbidden("not a participant".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn not_found_returns_404_and_correct_body() {
        let response = AppError::NotFound("Chat not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "NotFound");
        assert_eq!(json["message"], "Chat not found");
        assert_eq!(json["statusCode"], 404);
    }

    #[tokio::test]
    async fn conflict_returns_409() {
        let response = AppError::Conflict("Username already taken".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn validation_returns_422_with_field_details() {
        let response = AppError::Validation(vec![FieldError {
            field: "username".into(),
            message: "must be 3-50 characters".into(),
        }])
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Validation");
        assert_eq!(json["details"][0]["field"], "username");
        assert_eq!(json["details"][0]["message"], "must be 3-50 characters");
    }

    #[tokio::test]
    async fn rate_limited_returns_429_with_retry_after() {
        let response = AppError::RateLimited { retry_after_ms: 750 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "RateLimited");
        assert_eq!(json["details"]["retryAfter"], 750);
    }

    #[tokio::test]
    async fn database_error_maps_to_503_with_scrubbed_message() {
        let response = AppError::Database(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "ServiceUnavailable");
        assert_eq!(json["message"], "Service temporarily unavailable");
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn socket_code_surfaces_domain_tokens() {
        assert_eq!(
            AppError::Forbidden("NotAParticipant".into()).socket_code(),
            "NotAParticipant"
        );
        assert_eq!(
            AppError::BadRequest("ContentTooLarge".into()).socket_code(),
            "ContentTooLarge"
        );
        // Prose messages fall back to the kind code.
        assert_eq!(
            AppError::Forbidden("Only the sender can edit a message".into()).socket_code(),
            "Forbidden"
        );
        assert_eq!(
            AppError::RateLimited { retry_after_ms: 10 }.socket_code(),
            "RateLimited"
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::Forbidden("x".into()).code(), "Forbidden");
        assert_eq!(
            AppError::RateLimited { retry_after_ms: 1 }.code(),
            "RateLimited"
        );
        assert_eq!(
            AppError::Database(sqlx::Error::RowNotFound).code(),
            "ServiceUnavailable"
        );
    }
}
