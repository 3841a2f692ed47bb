use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const ISSUER: &str = "messenger";
const AUDIENCE: &str = "messenger-clients";

/// Access tokens are short-lived; exposure via query parameters or logs is
/// bounded by this window.
const ACCESS_TOKEN_MINUTES: i64 = 15;

/// Refresh tokens define the session lifetime.
const REFRESH_TOKEN_DAYS: i64 = 30;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
    pub username: String,
    /// Session this credential belongs to. Lets a socket attach to its
    /// session without ever seeing the refresh credential.
    pub sid: Uuid,
    /// Distinguishes access tokens (short-lived) from refresh tokens
    /// (long-lived). Each kind is signed with its own secret, so one can
    /// never pass verification as the other.
    pub token_type: TokenType,
}

impl Claims {
    fn new(
        user_id: Uuid,
        username: String,
        session_id: Uuid,
        lifetime: Duration,
        token_type: TokenType,
    ) -> Self {
        let now = Utc::now();

        Claims {
            sub: user_id.to_string(),
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            username,
            sid: session_id,
            token_type,
        }
    }

    pub fn user_id(&self) -> AppResult<Uuid> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::Unauthorized("Invalid user ID in token".into()))
    }
}

// ============================================================================
// Credential verification
// ============================================================================

/// Why a credential was rejected. `Expired` tells the client to refresh;
/// `Invalid` means re-login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    Expired,
    Invalid,
}

impl CredentialError {
    pub fn reason(self) -> &'static str {
        match self {
            CredentialError::Expired => "Token expired",
            CredentialError::Invalid => "Invalid token",
        }
    }
}

impl From<CredentialError> for AppError {
    fn from(e: CredentialError) -> Self {
        AppError::Unauthorized(e.reason().into())
    }
}

pub fn create_access_token(
    user_id: Uuid,
    username: String,
    session_id: Uuid,
    secret: &str,
) -> AppResult<String> {
    let claims = Claims::new(
        user_id,
        username,
        session_id,
        Duration::minutes(ACCESS_TOKEN_MINUTES),
        TokenType::Access,
    );
    sign(&claims, secret)
}

pub fn create_refresh_token(
    user_id: Uuid,
    username: String,
    session_id: Uuid,
    secret: &str,
) -> AppResult<String> {
    let claims = Claims::new(
        user_id,
        username,
        session_id,
        Duration::days(REFRESH_TOKEN_DAYS),
        TokenType::Refresh,
    );
    sign(&claims, secret)
}

fn sign(claims: &Claims, secret: &str) -> AppResult<String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = ?e, "Failed to sign token");
        AppError::Internal
    })
}

/// Verify signature, expiry, issuer and audience, returning the claims.
///
/// Expired credentials are reported distinctly from malformed or forged ones.
pub fn validate_token(
    token: &str,
    secret: &str,
    expected_type: TokenType,
) -> Result<Claims, CredentialError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.set_audience(&[AUDIENCE]);

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => CredentialError::Expired,
        _ => CredentialError::Invalid,
    })?;

    if claims.token_type != expected_type {
        return Err(CredentialError::Invalid);
    }

    Ok(claims)
}

// ============================================================================
// Session token digests
// ============================================================================

/// The session token stored and looked up in the database is the SHA-256
/// digest of the refresh credential. SHA-256 rather than bcrypt because the
/// lookup must be deterministic; the input is already a high-entropy signed
/// token, not a guessable password.
pub fn hash_session_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Password Hashing
// ============================================================================

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, 12).map_err(|e| {
        tracing::error!(error = ?e, "Failed to hash password");
        AppError::Internal
    })
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| {
        tracing::error!(error = ?e, "Failed to verify password");
        AppError::Internal
    })
}

// ============================================================================
// Auth Middleware
// ============================================================================

/// Authenticated user extracted from a valid access-token bearer header.
///
/// Fields are private: the only valid constructor is the `FromRequestParts`
/// impl, preventing handlers from forging an `AuthUser` via struct literal.
pub struct AuthUser {
    user_id: Uuid,
    session_id: Uuid,
    username: String,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn auth_error(message: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized",
            "message": message,
            "statusCode": 401,
        })),
    )
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| auth_error("Missing or invalid Authorization header"))?;

        let claims = validate_token(
            bearer.token(),
            &state.config.access_token_secret,
            TokenType::Access,
        )
        .map_err(|e| auth_error(e.reason()))?;

        let user_id = claims
            .user_id()
            .map_err(|_| auth_error("Invalid token subject"))?;

        Ok(AuthUser {
            user_id,
            session_id: claims.sid,
            username: claims.username,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-min-32-characters-long!!";
    const OTHER_SECRET: &str = "other-secret-min-32-characters-long!";

    // ------------------------------------------------------------------------
    // hash_session_token
    // ------------------------------------------------------------------------

    #[test]
    fn session_token_digest_is_64_char_hex() {
        let hash = hash_session_token("some-random-token");
        assert_eq!(hash.len(), 64, "SHA-256 hex output must be 64 characters");
        assert!(
            hash.chars().all(|c| c.is_ascii_hexdigit()),
            "Output must be lowercase hex"
        );
    }

    #[test]
    fn session_token_digest_is_deterministic() {
        let token = "deterministic-test-token";
        assert_eq!(hash_session_token(token), hash_session_token(token));
    }

    #[test]
    fn session_token_digest_differs_on_different_inputs() {
        assert_ne!(
            hash_session_token("token-alpha"),
            hash_session_token("token-beta")
        );
    }

    // ------------------------------------------------------------------------
    // Token mint / validate
    // ------------------------------------------------------------------------

    #[test]
    fn access_token_roundtrip_happy_path() {
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = create_access_token(user_id, "alice".into(), session_id, TEST_SECRET)
            .expect("create_access_token should succeed");

        let claims = validate_token(&token, TEST_SECRET, TokenType::Access)
            .expect("fresh access token should validate");

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn refresh_token_roundtrip_happy_path() {
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = create_refresh_token(user_id, "bob".into(), session_id, TEST_SECRET)
            .expect("create_refresh_token should succeed");

        let claims = validate_token(&token, TEST_SECRET, TokenType::Refresh)
            .expect("fresh refresh token should validate");

        assert_eq!(claims.token_type, TokenType::Refresh);
        assert_eq!(claims.sid, session_id);
    }

    #[test]
    fn refresh_token_rejected_where_access_expected() {
        let token = create_refresh_token(Uuid::new_v4(), "carol".into(), Uuid::new_v4(), TEST_SECRET)
            .expect("create_refresh_token should succeed");

        // Same secret, wrong type — must be rejected as Invalid, not Expired.
        assert_eq!(
            validate_token(&token, TEST_SECRET, TokenType::Access),
            Err(CredentialError::Invalid)
        );
    }

    #[test]
    fn validate_token_rejects_wrong_secret() {
        let token = create_access_token(Uuid::new_v4(), "dave".into(), Uuid::new_v4(), TEST_SECRET)
            .expect("create_access_token should succeed");

        assert_eq!(
            validate_token(&token, OTHER_SECRET, TokenType::Access),
            Err(CredentialError::Invalid)
        );
    }

    #[test]
    fn validate_token_rejects_malformed_and_empty_strings() {
        assert_eq!(
            validate_token("this.is.not.a.valid.jwt", TEST_SECRET, TokenType::Access),
            Err(CredentialError::Invalid)
        );
        assert_eq!(
            validate_token("", TEST_SECRET, TokenType::Access),
            Err(CredentialError::Invalid)
        );
    }

    #[test]
    fn expired_token_is_distinguished_from_invalid() {
        // Hand-build claims already past expiry.
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: (now - Duration::minutes(5)).timestamp(),
            iat: (now - Duration::minutes(20)).timestamp(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            username: "eve".into(),
            sid: Uuid::new_v4(),
            token_type: TokenType::Access,
        };
        let token = sign(&claims, TEST_SECRET).expect("signing should succeed");

        assert_eq!(
            validate_token(&token, TEST_SECRET, TokenType::Access),
            Err(CredentialError::Expired)
        );
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: (now + Duration::minutes(15)).timestamp(),
            iat: now.timestamp(),
            iss: "somebody-else".into(),
            aud: AUDIENCE.to_string(),
            username: "mallory".into(),
            sid: Uuid::new_v4(),
            token_type: TokenType::Access,
        };
        let token = sign(&claims, TEST_SECRET).expect("signing should succeed");

        assert_eq!(
            validate_token(&token, TEST_SECRET, TokenType::Access),
            Err(CredentialError::Invalid)
        );
    }

    // ------------------------------------------------------------------------
    // Password hashing
    // ------------------------------------------------------------------------

    #[test]
    fn password_hash_verify_roundtrip_correct_password() {
        let password = "super-secure-password-123!";
        let hash = hash_password(password).expect("hash_password should succeed");

        assert!(verify_password(password, &hash)
            .expect("verify_password should not error on a valid hash"));
    }

    #[test]
    fn password_hash_verify_roundtrip_wrong_password() {
        let hash = hash_password("correct-password").expect("hash_password should succeed");

        assert!(!verify_password("wrong-password", &hash)
            .expect("verify_password should not error on a valid hash"));
    }

    // ------------------------------------------------------------------------
    // Claims::user_id()
    // ------------------------------------------------------------------------

    #[test]
    fn claims_user_id_rejects_invalid_sub() {
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            exp: 9999999999,
            iat: 0,
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            username: "frank".to_string(),
            sid: Uuid::new_v4(),
            token_type: TokenType::Access,
        };

        assert!(claims.user_id().is_err());
    }
}
