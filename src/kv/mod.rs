use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// ============================================================================
// Key namespace
// ============================================================================

/// Fleet-visible set of user IDs with at least one live socket anywhere.
pub const ONLINE_SET: &str = "user:online";

/// Durable stream of pending delivery units.
pub const DELIVERY_STREAM: &str = "message-delivery-stream";

/// Dead-letter stream for delivery units that exhausted their retries.
pub const DELIVERY_DEAD_STREAM: &str = "message-delivery-dead";

pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}

pub fn user_status_key(user_id: Uuid) -> String {
    format!("user:status:{user_id}")
}

pub fn typing_key(chat_id: Uuid, user_id: Uuid) -> String {
    format!("typing:{chat_id}:{user_id}")
}

pub fn ratelimit_key(bucket: &str, key: &str) -> String {
    format!("ratelimit:{bucket}:{key}")
}

// ============================================================================
// Client
// ============================================================================

/// Shared KV store client.
///
/// Wraps a multiplexed [`ConnectionManager`] for commands (auto-reconnects
/// under the hood) and keeps the underlying [`redis::Client`] so subscriber
/// tasks can open their own dedicated pub/sub connections.
#[derive(Clone)]
pub struct Kv {
    manager: ConnectionManager,
    client: redis::Client,
}

impl Kv {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        info!("Connecting to KV store...");
        let client = redis::Client::open(redis_url).map_err(AppError::Kv)?;

        // Per-command response deadline; a hung broker call must not wedge a
        // socket handler.
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(Duration::from_secs(5)))
            .set_response_timeout(Some(Duration::from_secs(5)));

        let manager = ConnectionManager::new_with_config(client.clone(), config)
            .await
            .map_err(|e| {
                tracing::error!(error = ?e, "Failed to connect to KV store");
                AppError::Kv(e)
            })?;

        info!("KV store connection established");
        Ok(Kv { manager, client })
    }

    /// Cheap clone of the command connection. All clones multiplex over the
    /// same underlying connection.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The raw client, for opening dedicated pub/sub connections.
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub async fn health_check(&self) -> AppResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(AppError::Kv)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let chat = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert_eq!(session_key("abc123"), "session:abc123");
        assert_eq!(
            user_status_key(user),
            format!("user:status:{user}")
        );
        assert_eq!(
            typing_key(chat, user),
            format!("typing:{chat}:{user}")
        );
        assert_eq!(
            ratelimit_key("message", &user.to_string()),
            format!("ratelimit:message:{user}")
        );
    }
}
