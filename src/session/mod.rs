use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::kv::{self, Kv};
use crate::models::{DeviceInfo, Session};

/// Session rows live this long from creation.
pub const SESSION_LIFETIME_DAYS: i64 = 30;

/// Cache TTL for `session:<token>` entries.
const CACHE_TTL_SECS: u64 = 3600;

const SESSION_COLUMNS: &str = "id, user_id, session_token, device_id, device_type, device_name, \
     ip_address, user_agent, socket_id, is_active, created_at, expires_at, last_activity";

/// Persistent session records with a KV cache in front.
///
/// The database is authoritative; the cache is a 1-hour read-through that is
/// dropped (not patched) on every mutation, so a stale entry can never
/// resurrect an invalidated session past the TTL guard in [`is_live`].
#[derive(Clone)]
pub struct SessionStore {
    db: Db,
    kv: Kv,
}

/// A session is live while it is active and unexpired. Checked on every read
/// path, including cache hits, so `find_by_token` can never return a session
/// that expired while cached.
pub fn is_live(session: &Session, now: DateTime<Utc>) -> bool {
    session.is_active && session.expires_at > now
}

impl SessionStore {
    pub fn new(db: Db, kv: Kv) -> Self {
        SessionStore { db, kv }
    }

    /// Insert a session with a caller-minted ID. The ID is generated before
    /// the refresh credential is signed so the credential can carry it as the
    /// `sid` claim.
    pub async fn create(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        token_digest: &str,
        device: &DeviceInfo,
    ) -> AppResult<Session> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions
                 (id, user_id, session_token, device_id, device_type, device_name,
                  ip_address, user_agent, is_active, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(user_id)
        .bind(token_digest)
        .bind(&device.device_id)
        .bind(&device.device_type)
        .bind(&device.device_name)
        .bind(&device.ip_address)
        .bind(&device.user_agent)
        .bind(Utc::now() + Duration::days(SESSION_LIFETIME_DAYS))
        .fetch_one(self.db.writer())
        .await?;

        self.prime_cache(&session).await;
        Ok(session)
    }

    /// Look up a live session by token digest, cache first.
    ///
    /// Returns `Unauthorized` when the token is unknown, inactive, or past
    /// its expiry.
    pub async fn find_by_token(&self, token_digest: &str) -> AppResult<Session> {
        let key = kv::session_key(token_digest);
        let mut conn = self.kv.conn();

        let cached: Option<String> = conn.get(&key).await.unwrap_or_else(|e| {
            tracing::debug!(error = ?e, "Session cache read failed; falling back to database");
            None
        });

        if let Some(raw) = cached {
            if let Ok(session) = serde_json::from_str::<Session>(&raw) {
                if is_live(&session, Utc::now()) {
                    return Ok(session);
                }
                // Expired while cached — drop it and fall through to the DB,
                // which will also miss.
                let _: Result<(), _> = conn.del(&key).await;
            }
        }

        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE session_token = $1 AND is_active = TRUE AND expires_at > NOW()"
        ))
        .bind(token_digest)
        .fetch_optional(self.db.writer())
        .await?
        .ok_or_else(invalid_session)?;

        self.prime_cache(&session).await;
        Ok(session)
    }

    /// Record the live socket for a session on connect.
    pub async fn attach_socket(&self, session_id: Uuid, socket_id: Uuid) -> AppResult<()> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "UPDATE sessions SET socket_id = $2, last_activity = NOW()
             WHERE id = $1 AND is_active = TRUE
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(socket_id)
        .fetch_optional(self.db.writer())
        .await?
        .ok_or_else(invalid_session)?;

        self.drop_cache(&session.session_token).await;
        Ok(())
    }

    /// Clear the socket reference on disconnect. Guarded by socket ID so a
    /// reconnect that already attached a newer socket is not clobbered.
    pub async fn detach_socket(&self, session_id: Uuid, socket_id: Uuid) -> AppResult<()> {
        let detached = sqlx::query_as::<_, Session>(&format!(
            "UPDATE sessions SET socket_id = NULL, last_activity = NOW()
             WHERE id = $1 AND socket_id = $2
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(socket_id)
        .fetch_optional(self.db.writer())
        .await?;

        if let Some(session) = detached {
            self.drop_cache(&session.session_token).await;
        }
        Ok(())
    }

    /// Terminate one session (logout).
    pub async fn invalidate(&self, token_digest: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE sessions SET is_active = FALSE, socket_id = NULL WHERE session_token = $1",
        )
        .bind(token_digest)
        .execute(self.db.writer())
        .await?;

        self.drop_cache(token_digest).await;
        Ok(())
    }

    /// Terminate one session by ID (logout from the session the caller's
    /// access token belongs to).
    pub async fn invalidate_by_id(&self, session_id: Uuid) -> AppResult<()> {
        let token: Option<String> = sqlx::query_scalar(
            "UPDATE sessions SET is_active = FALSE, socket_id = NULL
             WHERE id = $1
             RETURNING session_token",
        )
        .bind(session_id)
        .fetch_optional(self.db.writer())
        .await?;

        if let Some(token) = token {
            self.drop_cache(&token).await;
        }
        Ok(())
    }

    /// Terminate every active session of a user (logout everywhere).
    pub async fn invalidate_all_for_user(&self, user_id: Uuid) -> AppResult<u64> {
        let tokens: Vec<String> = sqlx::query_scalar(
            "UPDATE sessions SET is_active = FALSE, socket_id = NULL
             WHERE user_id = $1 AND is_active = TRUE
             RETURNING session_token",
        )
        .bind(user_id)
        .fetch_all(self.db.writer())
        .await?;

        for token in &tokens {
            self.drop_cache(token).await;
        }
        Ok(tokens.len() as u64)
    }

    /// Bump `last_activity`. Called on refresh and other authenticated
    /// activity; failures are non-fatal for the caller.
    pub async fn touch(&self, token_digest: &str) -> AppResult<()> {
        sqlx::query("UPDATE sessions SET last_activity = NOW() WHERE session_token = $1")
            .bind(token_digest)
            .execute(self.db.writer())
            .await?;

        self.drop_cache(token_digest).await;
        Ok(())
    }

    async fn prime_cache(&self, session: &Session) {
        let Ok(raw) = serde_json::to_string(session) else {
            return;
        };
        let mut conn = self.kv.conn();
        let key = kv::session_key(&session.session_token);
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, raw, CACHE_TTL_SECS).await {
            tracing::debug!(error = ?e, "Failed to prime session cache");
        }
    }

    async fn drop_cache(&self, token_digest: &str) {
        let mut conn = self.kv.conn();
        let key = kv::session_key(token_digest);
        if let Err(e) = conn.del::<_, ()>(&key).await {
            tracing::debug!(error = ?e, "Failed to drop session cache entry");
        }
    }
}

fn invalid_session() -> AppError {
    AppError::Unauthorized("Invalid session".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(is_active: bool, expires_in_secs: i64) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            session_token: "digest".into(),
            device_id: None,
            device_type: None,
            device_name: None,
            ip_address: None,
            user_agent: None,
            socket_id: None,
            is_active,
            created_at: now,
            expires_at: now + Duration::seconds(expires_in_secs),
            last_activity: now,
        }
    }

    #[test]
    fn live_session_passes_guard() {
        assert!(is_live(&session(true, 3600), Utc::now()));
    }

    #[test]
    fn inactive_session_fails_guard() {
        assert!(!is_live(&session(false, 3600), Utc::now()));
    }

    #[test]
    fn expired_session_fails_guard() {
        assert!(!is_live(&session(true, -10), Utc::now()));
    }

    #[test]
    fn cached_session_roundtrips_through_json() {
        let original = session(true, 3600);
        let raw = serde_json::to_string(&original).unwrap();
        let parsed: Session = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed.id, original.id);
        assert_eq!(parsed.session_token, original.session_token);
        assert_eq!(parsed.is_active, original.is_active);
    }
}
