use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::Db;
use crate::error::AppResult;
use crate::kv::{self, Kv};
use crate::models::PresenceStatus;
use crate::pubsub::{PubSubBridge, CH_USER_STATUS};
use crate::scheduler::{Job, Scheduler};

/// Presence snapshots expire 5 minutes after the last heartbeat.
const STATUS_TTL_SECS: i64 = 300;

/// A socket that has not heartbeat within this window is treated as detached.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(60);

// ============================================================================
// Local roster
// ============================================================================

/// Per-node bookkeeping of live sockets: user → socket set, plus a heartbeat
/// timestamp per socket. Mutated only through [`PresenceRegistry`].
#[derive(Default)]
struct Roster {
    users: HashMap<Uuid, HashSet<Uuid>>,
    heartbeats: HashMap<Uuid, (Uuid, Instant)>,
}

impl Roster {
    /// Returns `true` if this is the user's first live socket on this node.
    fn add(&mut self, user_id: Uuid, socket_id: Uuid, now: Instant) -> bool {
        self.heartbeats.insert(socket_id, (user_id, now));
        let sockets = self.users.entry(user_id).or_default();
        sockets.insert(socket_id);
        sockets.len() == 1
    }

    /// Returns `true` if the user now has zero live sockets on this node.
    fn remove(&mut self, user_id: Uuid, socket_id: Uuid) -> bool {
        self.heartbeats.remove(&socket_id);
        match self.users.get_mut(&user_id) {
            Some(sockets) => {
                sockets.remove(&socket_id);
                if sockets.is_empty() {
                    self.users.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn beat(&mut self, socket_id: Uuid, now: Instant) {
        if let Some(entry) = self.heartbeats.get_mut(&socket_id) {
            entry.1 = now;
        }
    }

    fn stale(&self, ttl: Duration, now: Instant) -> Vec<(Uuid, Uuid)> {
        self.heartbeats
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) > ttl)
            .map(|(socket_id, (user_id, _))| (*user_id, *socket_id))
            .collect()
    }

    fn sockets_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.users
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Tracks which users hold live sockets, locally and fleet-wide.
///
/// The local roster is authoritative for this node's sockets; the fleet view
/// lives in the KV store (`user:online` set plus a `user:status:<id>` hash
/// carrying status and a cross-node socket count). Cheaply cloneable.
#[derive(Clone)]
pub struct PresenceRegistry {
    roster: Arc<RwLock<Roster>>,
    kv: Kv,
    db: Db,
    bus: PubSubBridge,
    scheduler: Scheduler,
    grace: Duration,
}

impl PresenceRegistry {
    pub fn new(kv: Kv, db: Db, bus: PubSubBridge, scheduler: Scheduler, grace: Duration) -> Self {
        PresenceRegistry {
            roster: Arc::new(RwLock::new(Roster::default())),
            kv,
            db,
            bus,
            scheduler,
            grace,
        }
    }

    /// Register a socket. Publishes `user.status(online)` when this is the
    /// user's first socket anywhere in the fleet and the user was not already
    /// marked online (a reconnect inside the grace window stays silent).
    pub async fn attach(&self, user_id: Uuid, socket_id: Uuid) -> AppResult<()> {
        self.roster
            .write()
            .await
            .add(user_id, socket_id, Instant::now());

        let key = kv::user_status_key(user_id);
        let mut conn = self.kv.conn();

        let previous: Option<String> = conn.hget(&key, "status").await?;
        let count: i64 = conn.hincr(&key, "socket_count", 1i64).await?;

        // Only the fleet's first socket resets the status; further devices
        // must not clobber a client-requested `away`.
        if count == 1 {
            let _: () = conn
                .hset(&key, "status", PresenceStatus::Online.to_string())
                .await?;
            let _: () = conn.sadd(kv::ONLINE_SET, user_id.to_string()).await?;
        }
        let _: () = conn
            .hset(&key, "last_activity", Utc::now().to_rfc3339())
            .await?;
        let _: () = conn.expire(&key, STATUS_TTL_SECS).await?;

        // A reconnect inside the grace window finds the status still
        // `online` and stays silent.
        let was_online = previous.as_deref() == Some("online");
        if count == 1 && !was_online {
            self.persist_status(user_id, PresenceStatus::Online).await;
            self.publish_status(user_id, PresenceStatus::Online).await;
        }

        Ok(())
    }

    /// Deregister a socket. When the fleet-wide socket count reaches zero the
    /// offline publication is deferred by the grace window to absorb
    /// reconnects.
    pub async fn detach(&self, user_id: Uuid, socket_id: Uuid) -> AppResult<()> {
        self.roster.write().await.remove(user_id, socket_id);

        let key = kv::user_status_key(user_id);
        let mut conn = self.kv.conn();

        let count: i64 = conn.hincr(&key, "socket_count", -1i64).await?;
        if count < 0 {
            // Counter drift (e.g. a node died without detaching); clamp.
            let _: () = conn.hset(&key, "socket_count", 0i64).await?;
        }

        if count <= 0 {
            self.scheduler
                .schedule(Job::OfflineGrace { user_id }, self.grace);
        }

        Ok(())
    }

    /// Grace-window callback: publish `offline` if the user is still gone.
    ///
    /// Re-checks the fleet count and the current status, so overlapping grace
    /// jobs or a reconnect in the meantime publish nothing.
    pub async fn finalize_offline(&self, user_id: Uuid) -> AppResult<()> {
        let key = kv::user_status_key(user_id);
        let mut conn = self.kv.conn();

        let count: Option<i64> = conn.hget(&key, "socket_count").await?;
        if count.unwrap_or(0) > 0 {
            return Ok(());
        }

        let status: Option<String> = conn.hget(&key, "status").await?;
        if status.as_deref() == Some("offline") {
            return Ok(());
        }

        let _: () = conn.srem(kv::ONLINE_SET, user_id.to_string()).await?;
        let _: () = conn
            .hset(&key, "status", PresenceStatus::Offline.to_string())
            .await?;

        self.persist_status(user_id, PresenceStatus::Offline).await;
        self.publish_status(user_id, PresenceStatus::Offline).await;
        Ok(())
    }

    /// Client-requested status. Honored only while the user holds at least
    /// one live socket somewhere.
    pub async fn set_status(&self, user_id: Uuid, status: PresenceStatus) -> AppResult<()> {
        let key = kv::user_status_key(user_id);
        let mut conn = self.kv.conn();

        let count: Option<i64> = conn.hget(&key, "socket_count").await?;
        if count.unwrap_or(0) <= 0 {
            return Ok(());
        }

        let _: () = conn.hset(&key, "status", status.to_string()).await?;
        let _: () = conn.expire(&key, STATUS_TTL_SECS).await?;

        self.persist_status(user_id, status).await;
        self.publish_status(user_id, status).await;
        Ok(())
    }

    /// Refresh the socket's heartbeat deadline and the snapshot TTL.
    pub async fn heartbeat(&self, user_id: Uuid, socket_id: Uuid) -> AppResult<()> {
        self.roster.write().await.beat(socket_id, Instant::now());

        let key = kv::user_status_key(user_id);
        let mut conn = self.kv.conn();
        let _: () = conn
            .hset(&key, "last_activity", Utc::now().to_rfc3339())
            .await?;
        let _: () = conn.expire(&key, STATUS_TTL_SECS).await?;
        Ok(())
    }

    /// Local sockets whose heartbeat lapsed. The caller closes them, which
    /// drives the normal detach path.
    pub async fn stale_sockets(&self) -> Vec<(Uuid, Uuid)> {
        self.roster.read().await.stale(HEARTBEAT_TTL, Instant::now())
    }

    /// Fleet-wide online check, used by delivery workers.
    pub async fn is_online(&self, user_id: Uuid) -> AppResult<bool> {
        let mut conn = self.kv.conn();
        let online: bool = conn.sismember(kv::ONLINE_SET, user_id.to_string()).await?;
        Ok(online)
    }

    /// This node's live sockets for a user.
    pub async fn local_sockets(&self, user_id: Uuid) -> Vec<Uuid> {
        self.roster.read().await.sockets_of(user_id)
    }

    async fn publish_status(&self, user_id: Uuid, status: PresenceStatus) {
        self.bus
            .publish(
                CH_USER_STATUS,
                json!({
                    "userId": user_id,
                    "status": status,
                    "timestamp": Utc::now(),
                }),
            )
            .await;
    }

    /// Mirror the status onto the user row. Non-fatal: the KV view is the
    /// live source, the row is for cold reads.
    async fn persist_status(&self, user_id: Uuid, status: PresenceStatus) {
        let result = sqlx::query("UPDATE users SET status = $2, last_seen = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(status.to_string())
            .execute(self.db.writer())
            .await;

        if let Err(e) = result {
            tracing::warn!(user_id = %user_id, error = ?e, "Failed to persist presence status");
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_socket_is_flagged() {
        let mut roster = Roster::default();
        let user = Uuid::new_v4();
        let now = Instant::now();

        assert!(roster.add(user, Uuid::new_v4(), now));
        assert!(!roster.add(user, Uuid::new_v4(), now));
    }

    #[test]
    fn removing_last_socket_is_flagged() {
        let mut roster = Roster::default();
        let user = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let now = Instant::now();

        roster.add(user, s1, now);
        roster.add(user, s2, now);

        assert!(!roster.remove(user, s1));
        assert!(roster.remove(user, s2));
        assert!(roster.sockets_of(user).is_empty());
    }

    #[test]
    fn removing_unknown_socket_reports_empty() {
        let mut roster = Roster::default();
        assert!(roster.remove(Uuid::new_v4(), Uuid::new_v4()));
    }

    #[test]
    fn stale_finds_only_lapsed_sockets() {
        let mut roster = Roster::default();
        let user = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let lapsed = Uuid::new_v4();

        let start = Instant::now();
        roster.add(user, lapsed, start);
        let later = start + Duration::from_secs(45);
        roster.add(user, fresh, later);

        // 70 seconds after the first socket's last beat: only it is stale.
        let now = start + Duration::from_secs(70);
        let stale = roster.stale(HEARTBEAT_TTL, now);
        assert_eq!(stale, vec![(user, lapsed)]);
    }

    #[test]
    fn heartbeat_refreshes_deadline() {
        let mut roster = Roster::default();
        let user = Uuid::new_v4();
        let socket = Uuid::new_v4();

        let start = Instant::now();
        roster.add(user, socket, start);
        roster.beat(socket, start + Duration::from_secs(50));

        // 80 seconds in, but only 30 since the last beat.
        let now = start + Duration::from_secs(80);
        assert!(roster.stale(HEARTBEAT_TTL, now).is_empty());
    }

    #[test]
    fn sockets_of_lists_live_sockets() {
        let mut roster = Roster::default();
        let user = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let now = Instant::now();

        roster.add(user, s1, now);
        assert_eq!(roster.sockets_of(user), vec![s1]);
        assert!(roster.sockets_of(Uuid::new_v4()).is_empty());
    }
}
