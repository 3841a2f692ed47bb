use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppResult;
use crate::kv::{self, Kv};
use crate::pubsub::{PubSubBridge, CH_TYPING_START, CH_TYPING_STOP};

/// Typing flags expire 5 seconds after the last `start`.
pub const TYPING_TTL_SECS: u64 = 5;

/// A repeated `start` inside this window refreshes the TTL but is not
/// republished to the fleet.
pub const REPUBLISH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Decide whether a fresh `start` should be published, updating the debounce
/// map. Entries are pruned once they can no longer suppress anything.
fn should_publish(
    recent: &mut HashMap<(Uuid, Uuid), Instant>,
    key: (Uuid, Uuid),
    now: Instant,
    debounce: Duration,
) -> bool {
    recent.retain(|_, last| now.duration_since(*last) < debounce);

    match recent.get(&key) {
        Some(last) if now.duration_since(*last) < debounce => false,
        _ => {
            recent.insert(key, now);
            true
        }
    }
}

/// Short-TTL set of "user X is typing in chat Y" flags.
///
/// The KV store is authoritative (consumers on other nodes read nothing from
/// us directly); the local map only debounces republication.
#[derive(Clone)]
pub struct TypingTracker {
    kv: Kv,
    bus: PubSubBridge,
    recent: Arc<Mutex<HashMap<(Uuid, Uuid), Instant>>>,
}

impl TypingTracker {
    pub fn new(kv: Kv, bus: PubSubBridge) -> Self {
        TypingTracker {
            kv,
            bus,
            recent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mark the user as typing. Idempotent: a re-start while the flag is live
    /// refreshes the TTL and suppresses the publish inside the debounce
    /// window.
    pub async fn start(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.kv.conn();
        let _: () = conn
            .set_ex(kv::typing_key(chat_id, user_id), 1u8, TYPING_TTL_SECS)
            .await?;

        let publish = {
            let mut recent = self.recent.lock().await;
            should_publish(
                &mut recent,
                (chat_id, user_id),
                Instant::now(),
                REPUBLISH_DEBOUNCE,
            )
        };

        if publish {
            self.bus
                .publish(
                    CH_TYPING_START,
                    json!({ "chatId": chat_id, "userId": user_id }),
                )
                .await;
        }
        Ok(())
    }

    /// Clear the flag and tell the fleet. Consumers auto-clear on TTL expiry
    /// anyway, so a missed stop costs at most the TTL.
    pub async fn stop(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.kv.conn();
        let _: () = conn.del(kv::typing_key(chat_id, user_id)).await?;

        self.recent.lock().await.remove(&(chat_id, user_id));

        self.bus
            .publish(
                CH_TYPING_STOP,
                json!({ "chatId": chat_id, "userId": user_id }),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_publishes() {
        let mut recent = HashMap::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        assert!(should_publish(
            &mut recent,
            key,
            Instant::now(),
            REPUBLISH_DEBOUNCE
        ));
    }

    #[test]
    fn restart_within_debounce_is_suppressed() {
        let mut recent = HashMap::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();

        assert!(should_publish(&mut recent, key, start, REPUBLISH_DEBOUNCE));
        assert!(!should_publish(
            &mut recent,
            key,
            start + Duration::from_millis(500),
            REPUBLISH_DEBOUNCE
        ));
    }

    #[test]
    fn restart_after_debounce_republishes() {
        let mut recent = HashMap::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();

        assert!(should_publish(&mut recent, key, start, REPUBLISH_DEBOUNCE));
        assert!(should_publish(
            &mut recent,
            key,
            start + Duration::from_millis(1500),
            REPUBLISH_DEBOUNCE
        ));
    }

    #[test]
    fn distinct_chats_do_not_debounce_each_other() {
        let mut recent = HashMap::new();
        let user = Uuid::new_v4();
        let now = Instant::now();

        assert!(should_publish(
            &mut recent,
            (Uuid::new_v4(), user),
            now,
            REPUBLISH_DEBOUNCE
        ));
        assert!(should_publish(
            &mut recent,
            (Uuid::new_v4(), user),
            now,
            REPUBLISH_DEBOUNCE
        ));
    }

    #[test]
    fn expired_entries_are_pruned() {
        let mut recent = HashMap::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();

        should_publish(&mut recent, key, start, REPUBLISH_DEBOUNCE);
        should_publish(
            &mut recent,
            (Uuid::new_v4(), Uuid::new_v4()),
            start + Duration::from_secs(5),
            REPUBLISH_DEBOUNCE,
        );

        assert_eq!(recent.len(), 1, "stale debounce entries should be dropped");
    }
}
