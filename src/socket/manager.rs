use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::frame;
use crate::messages::Broadcaster;

/// Outbound frames buffered per socket before overflow handling kicks in.
const OUTBOUND_BUFFER: usize = 256;

/// A socket that has dropped this many frames on a full buffer is closed —
/// the consumer is not keeping up and reconnecting is cheaper than an
/// unbounded backlog.
const OVERFLOW_CLOSE_THRESHOLD: u32 = 64;

struct SocketHandle {
    user_id: Uuid,
    tx: mpsc::Sender<String>,
    overflow: AtomicU32,
}

#[derive(Default)]
struct Inner {
    sockets: HashMap<Uuid, Arc<SocketHandle>>,
    users: HashMap<Uuid, HashSet<Uuid>>,
    /// Room membership per chat: the local sockets subscribed to its events.
    rooms: HashMap<Uuid, HashSet<Uuid>>,
    /// Reverse index for O(rooms-of-socket) cleanup on disconnect.
    socket_rooms: HashMap<Uuid, HashSet<Uuid>>,
}

impl Inner {
    /// Queue a frame on one socket. Returns `false` when the socket should be
    /// closed (channel gone, or overflow past the threshold).
    fn push(&self, socket_id: Uuid, raw: &str) -> bool {
        let Some(handle) = self.sockets.get(&socket_id) else {
            return true;
        };

        match handle.tx.try_send(raw.to_owned()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = handle.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped >= OVERFLOW_CLOSE_THRESHOLD {
                    tracing::warn!(
                        socket_id = %socket_id,
                        user_id = %handle.user_id,
                        dropped,
                        "Slow socket consumer; closing"
                    );
                    false
                } else {
                    true
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn remove(&mut self, socket_id: Uuid) {
        let Some(handle) = self.sockets.remove(&socket_id) else {
            return;
        };

        if let Some(sockets) = self.users.get_mut(&handle.user_id) {
            sockets.remove(&socket_id);
            if sockets.is_empty() {
                self.users.remove(&handle.user_id);
            }
        }

        if let Some(rooms) = self.socket_rooms.remove(&socket_id) {
            for chat_id in rooms {
                if let Some(members) = self.rooms.get_mut(&chat_id) {
                    members.remove(&socket_id);
                    if members.is_empty() {
                        self.rooms.remove(&chat_id);
                    }
                }
            }
        }
    }
}

/// Owns every connected socket on this node: per-socket outbound channels,
/// the user index, and per-chat rooms.
///
/// Cheaply cloneable — all clones share the same maps via `Arc`. Emission
/// never blocks: frames go through bounded channels and slow consumers are
/// dropped, not waited on.
#[derive(Clone, Default)]
pub struct SocketManager {
    inner: Arc<RwLock<Inner>>,
}

impl SocketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket and hand back the receive half its writer task
    /// drains.
    pub async fn register(&self, socket_id: Uuid, user_id: Uuid) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = Arc::new(SocketHandle {
            user_id,
            tx,
            overflow: AtomicU32::new(0),
        });

        let mut inner = self.inner.write().await;
        inner.sockets.insert(socket_id, handle);
        inner.users.entry(user_id).or_default().insert(socket_id);
        rx
    }

    /// Drop a socket and its room memberships. Closing the channel ends the
    /// writer task.
    pub async fn unregister(&self, socket_id: Uuid) {
        self.inner.write().await.remove(socket_id);
    }

    pub async fn join_room(&self, chat_id: Uuid, socket_id: Uuid) {
        let mut inner = self.inner.write().await;
        if !inner.sockets.contains_key(&socket_id) {
            return;
        }
        inner.rooms.entry(chat_id).or_default().insert(socket_id);
        inner
            .socket_rooms
            .entry(socket_id)
            .or_default()
            .insert(chat_id);
    }

    pub async fn leave_room(&self, chat_id: Uuid, socket_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(&chat_id) {
            members.remove(&socket_id);
            if members.is_empty() {
                inner.rooms.remove(&chat_id);
            }
        }
        if let Some(rooms) = inner.socket_rooms.get_mut(&socket_id) {
            rooms.remove(&chat_id);
        }
    }

    /// Subscribe all of a user's local sockets to a chat's room. Used when a
    /// participant is added to a chat while connected.
    pub async fn join_user_to_room(&self, chat_id: Uuid, user_id: Uuid) {
        let sockets: Vec<Uuid> = {
            let inner = self.inner.read().await;
            inner
                .users
                .get(&user_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        for socket_id in sockets {
            self.join_room(chat_id, socket_id).await;
        }
    }

    pub async fn remove_user_from_room(&self, chat_id: Uuid, user_id: Uuid) {
        let sockets: Vec<Uuid> = {
            let inner = self.inner.read().await;
            inner
                .users
                .get(&user_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        for socket_id in sockets {
            self.leave_room(chat_id, socket_id).await;
        }
    }

    pub async fn emit_to_socket(&self, socket_id: Uuid, event: &str, payload: Value) {
        let raw = frame(event, payload);
        let doomed = {
            let inner = self.inner.read().await;
            if inner.push(socket_id, &raw) {
                None
            } else {
                Some(socket_id)
            }
        };
        self.reap(doomed.into_iter()).await;
    }

    /// Emit to every local socket in a chat's room.
    pub async fn emit_to_chat(&self, chat_id: Uuid, event: &str, payload: Value) {
        let raw = frame(event, payload);
        let doomed: Vec<Uuid> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(&chat_id) else {
                return;
            };
            members
                .iter()
                .copied()
                .filter(|socket_id| !inner.push(*socket_id, &raw))
                .collect()
        };
        self.reap(doomed.into_iter()).await;
    }

    /// Emit to every local socket of one user.
    pub async fn emit_to_user(&self, user_id: Uuid, event: &str, payload: Value) {
        let raw = frame(event, payload);
        let doomed: Vec<Uuid> = {
            let inner = self.inner.read().await;
            let Some(sockets) = inner.users.get(&user_id) else {
                return;
            };
            sockets
                .iter()
                .copied()
                .filter(|socket_id| !inner.push(*socket_id, &raw))
                .collect()
        };
        self.reap(doomed.into_iter()).await;
    }

    pub async fn emit_to_users(&self, user_ids: &[Uuid], event: &str, payload: Value) {
        for user_id in user_ids {
            self.emit_to_user(*user_id, event, payload.clone()).await;
        }
    }

    /// Broadcast to every connected socket (used for `server:shutdown`).
    pub async fn emit_to_all(&self, event: &str, payload: Value) {
        let raw = frame(event, payload);
        let doomed: Vec<Uuid> = {
            let inner = self.inner.read().await;
            inner
                .sockets
                .keys()
                .copied()
                .filter(|socket_id| !inner.push(*socket_id, &raw))
                .collect()
        };
        self.reap(doomed.into_iter()).await;
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.read().await.users.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.sockets.len()
    }

    async fn reap(&self, doomed: impl Iterator<Item = Uuid>) {
        let doomed: Vec<Uuid> = doomed.collect();
        if doomed.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        for socket_id in doomed {
            inner.remove(socket_id);
        }
    }
}

#[async_trait]
impl Broadcaster for SocketManager {
    async fn emit_to_chat(&self, chat_id: Uuid, event: &str, payload: Value) {
        SocketManager::emit_to_chat(self, chat_id, event, payload).await;
    }

    async fn emit_to_user(&self, user_id: Uuid, event: &str, payload: Value) {
        SocketManager::emit_to_user(self, user_id, event, payload).await;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn recv_event(rx: &mut mpsc::Receiver<String>) -> Value {
        let raw = rx.recv().await.expect("frame expected");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn register_and_is_connected() {
        let mgr = SocketManager::new();
        let user = Uuid::new_v4();

        assert!(!mgr.is_connected(user).await);
        let _rx = mgr.register(Uuid::new_v4(), user).await;
        assert!(mgr.is_connected(user).await);
    }

    #[tokio::test]
    async fn unregister_clears_user_and_rooms() {
        let mgr = SocketManager::new();
        let user = Uuid::new_v4();
        let socket = Uuid::new_v4();
        let chat = Uuid::new_v4();

        let _rx = mgr.register(socket, user).await;
        mgr.join_room(chat, socket).await;
        mgr.unregister(socket).await;

        assert!(!mgr.is_connected(user).await);
        // Emitting into the vacated room must be a no-op.
        mgr.emit_to_chat(chat, "message:new", json!({})).await;
        assert_eq!(mgr.connection_count().await, 0);
    }

    #[tokio::test]
    async fn emit_to_chat_reaches_room_members_only() {
        let mgr = SocketManager::new();
        let chat = Uuid::new_v4();

        let in_room = Uuid::new_v4();
        let out_of_room = Uuid::new_v4();
        let mut rx_in = mgr.register(in_room, Uuid::new_v4()).await;
        let mut rx_out = mgr.register(out_of_room, Uuid::new_v4()).await;

        mgr.join_room(chat, in_room).await;
        mgr.emit_to_chat(chat, "message:new", json!({ "content": "hi" }))
            .await;

        let event = recv_event(&mut rx_in).await;
        assert_eq!(event["event"], "message:new");
        assert_eq!(event["data"]["content"], "hi");
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_to_user_reaches_every_device() {
        let mgr = SocketManager::new();
        let user = Uuid::new_v4();

        let mut rx1 = mgr.register(Uuid::new_v4(), user).await;
        let mut rx2 = mgr.register(Uuid::new_v4(), user).await;

        mgr.emit_to_user(user, "message:delivered", json!({ "ok": true }))
            .await;

        assert_eq!(recv_event(&mut rx1).await["event"], "message:delivered");
        assert_eq!(recv_event(&mut rx2).await["event"], "message:delivered");
    }

    #[tokio::test]
    async fn emit_to_disconnected_user_is_noop() {
        let mgr = SocketManager::new();
        mgr.emit_to_user(Uuid::new_v4(), "message:new", json!({}))
            .await;
    }

    #[tokio::test]
    async fn leave_room_stops_delivery() {
        let mgr = SocketManager::new();
        let chat = Uuid::new_v4();
        let socket = Uuid::new_v4();
        let mut rx = mgr.register(socket, Uuid::new_v4()).await;

        mgr.join_room(chat, socket).await;
        mgr.leave_room(chat, socket).await;
        mgr.emit_to_chat(chat, "message:new", json!({})).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_user_to_room_covers_all_sockets() {
        let mgr = SocketManager::new();
        let user = Uuid::new_v4();
        let chat = Uuid::new_v4();

        let mut rx1 = mgr.register(Uuid::new_v4(), user).await;
        let mut rx2 = mgr.register(Uuid::new_v4(), user).await;

        mgr.join_user_to_room(chat, user).await;
        mgr.emit_to_chat(chat, "typing:start", json!({})).await;

        assert_eq!(recv_event(&mut rx1).await["event"], "typing:start");
        assert_eq!(recv_event(&mut rx2).await["event"], "typing:start");
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_after_overflow_threshold() {
        let mgr = SocketManager::new();
        let user = Uuid::new_v4();
        let socket = Uuid::new_v4();
        // Never drained: the buffer fills, then overflow counts up.
        let _rx = mgr.register(socket, user).await;

        let flood = OUTBOUND_BUFFER + OVERFLOW_CLOSE_THRESHOLD as usize + 8;
        for i in 0..flood {
            mgr.emit_to_user(user, "message:new", json!({ "seq": i }))
                .await;
        }

        assert!(
            !mgr.is_connected(user).await,
            "socket should be dropped after sustained overflow"
        );
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let mgr = SocketManager::new();
        let clone = mgr.clone();
        let user = Uuid::new_v4();

        let _rx = mgr.register(Uuid::new_v4(), user).await;
        assert!(clone.is_connected(user).await);
    }
}
