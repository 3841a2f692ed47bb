use chrono::{DateTime, Utc};
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::kv::{Kv, DELIVERY_DEAD_STREAM, DELIVERY_STREAM};
use crate::messages::{mark_delivered, notify_delivered};
use crate::presence::PresenceRegistry;
use crate::pubsub::PubSubBridge;

/// Consumer group shared by every node's workers.
const GROUP: &str = "delivery-workers";

/// Units not acked within this window become eligible for redelivery.
const REDELIVERY_BASE_MS: u64 = 30_000;

/// A unit delivered this many times without an ack moves to the dead-letter
/// stream.
const MAX_ATTEMPTS: u64 = 5;

/// Units reserved per worker iteration.
const BATCH_SIZE: usize = 16;

/// How long a fresh read blocks before the loop re-checks pending entries.
const BLOCK_MS: usize = 5_000;

// ============================================================================
// Delivery unit
// ============================================================================

/// One queued fan-out work item: a committed message that must be pushed to a
/// recipient set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUnit {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub recipients: Vec<Uuid>,
    pub attempt: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Idle threshold before redelivery attempt `n` (1-based): 30 s, 60 s, 2 min,
/// 4 min, 8 min. The caller adds jitter.
pub fn backoff_ms(times_delivered: u64) -> u64 {
    let exponent = times_delivered.saturating_sub(1).min(4);
    REDELIVERY_BASE_MS << exponent
}

pub fn is_exhausted(times_delivered: u64) -> bool {
    times_delivered >= MAX_ATTEMPTS
}

// ============================================================================
// Queue
// ============================================================================

/// Append side of the durable delivery log.
#[derive(Clone)]
pub struct DeliveryQueue {
    kv: Kv,
}

impl DeliveryQueue {
    pub fn new(kv: Kv) -> Self {
        DeliveryQueue { kv }
    }

    /// Create the consumer group if this is the first node to boot against
    /// this stream. `BUSYGROUP` from a concurrent creator is fine.
    pub async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.kv.conn();
        match conn
            .xgroup_create_mkstream::<_, _, _, String>(DELIVERY_STREAM, GROUP, "$")
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(AppError::Kv(e)),
        }
    }

    /// Append a unit. Called after the send transaction commits; a failure
    /// here is surfaced so the caller can log it, but the message itself is
    /// already durable.
    pub async fn enqueue(&self, unit: &DeliveryUnit) -> AppResult<()> {
        let raw = serde_json::to_string(unit).map_err(|e| {
            tracing::error!(error = ?e, "Failed to serialize delivery unit");
            AppError::Internal
        })?;

        let mut conn = self.kv.conn();
        let _: String = conn.xadd(DELIVERY_STREAM, "*", &[("unit", raw)]).await?;
        Ok(())
    }

    async fn move_to_dead_letter(&self, entry_id: &str, raw_unit: &str) -> AppResult<()> {
        let mut conn = self.kv.conn();
        let _: String = conn
            .xadd(DELIVERY_DEAD_STREAM, "*", &[("unit", raw_unit)])
            .await?;
        let _: i64 = conn.xack(DELIVERY_STREAM, GROUP, &[entry_id]).await?;
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// One delivery worker loop. Each node runs N of these; the consumer group
/// guarantees a unit is reserved by at most one worker fleet-wide.
pub struct DeliveryWorker {
    pub queue: DeliveryQueue,
    pub db: Db,
    pub presence: PresenceRegistry,
    pub bus: PubSubBridge,
    pub consumer: String,
}

impl DeliveryWorker {
    pub async fn run(self) {
        tracing::info!(consumer = %self.consumer, "Delivery worker started");
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!(consumer = %self.consumer, error = ?e, "Delivery worker tick failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    async fn tick(&self) -> AppResult<()> {
        self.reap_pending().await?;

        let mut conn = self.queue.kv.conn();
        let opts = StreamReadOptions::default()
            .group(GROUP, &self.consumer)
            .count(BATCH_SIZE)
            .block(BLOCK_MS);

        let reply: StreamReadReply = conn
            .xread_options(&[DELIVERY_STREAM], &[">"], &opts)
            .await?;

        for key in reply.keys {
            for entry in key.ids {
                self.handle_entry(&entry).await;
            }
        }
        Ok(())
    }

    /// Retry units whose reservation lapsed; dead-letter the exhausted ones.
    async fn reap_pending(&self) -> AppResult<()> {
        let mut conn = self.queue.kv.conn();

        let pending: StreamPendingCountReply = conn
            .xpending_count(DELIVERY_STREAM, GROUP, "-", "+", BATCH_SIZE)
            .await?;

        for entry in pending.ids {
            let exhausted = is_exhausted(entry.times_delivered as u64);
            let eligible = entry.last_delivered_ms >= backoff_ms(entry.times_delivered as u64) as usize;
            if !exhausted && !eligible {
                continue;
            }

            // Claim the entry so no other worker races us on it. The idle
            // floor matches the eligibility threshold; exhausted entries are
            // taken unconditionally.
            let min_idle = if exhausted {
                0
            } else {
                backoff_ms(entry.times_delivered as u64) as usize
            };
            let claimed: Vec<StreamId> = {
                let reply: redis::streams::StreamClaimReply = conn
                    .xclaim(DELIVERY_STREAM, GROUP, &self.consumer, min_idle, &[&entry.id])
                    .await?;
                reply.ids
            };

            for stream_entry in claimed {
                if exhausted {
                    let raw: String = stream_entry.get("unit").unwrap_or_default();
                    tracing::error!(
                        entry_id = %stream_entry.id,
                        attempts = entry.times_delivered,
                        "Delivery unit exhausted retries; moving to dead letter"
                    );
                    self.queue
                        .move_to_dead_letter(&stream_entry.id, &raw)
                        .await?;
                } else {
                    self.handle_entry(&stream_entry).await;
                }
            }
        }
        Ok(())
    }

    /// Process one reserved entry and ack it. Unreachable recipients keep
    /// their `pending` record; the reconnect flush covers them, so the unit
    /// is acked regardless.
    async fn handle_entry(&self, entry: &StreamId) {
        let raw: Option<String> = entry.get("unit");
        let unit = raw
            .as_deref()
            .and_then(|raw| serde_json::from_str::<DeliveryUnit>(raw).ok());

        match unit {
            Some(unit) => {
                if let Err(e) = self.process(&unit).await {
                    tracing::warn!(
                        message_id = %unit.message_id,
                        error = ?e,
                        "Delivery unit processing failed; leaving for redelivery"
                    );
                    // No ack: the redelivery timer will hand it back.
                    return;
                }
            }
            None => {
                tracing::error!(entry_id = %entry.id, "Malformed delivery unit; acking to discard");
            }
        }

        let mut conn = self.queue.kv.conn();
        if let Err(e) = conn.xack::<_, _, _, i64>(DELIVERY_STREAM, GROUP, &[&entry.id]).await {
            tracing::warn!(entry_id = %entry.id, error = ?e, "Failed to ack delivery unit");
        }
    }

    async fn process(&self, unit: &DeliveryUnit) -> AppResult<()> {
        let sender_id: Option<Uuid> =
            sqlx::query_scalar("SELECT sender_id FROM messages WHERE id = $1")
                .bind(unit.message_id)
                .fetch_optional(self.db.writer())
                .await?
                .flatten();

        for recipient in &unit.recipients {
            let online = self.presence.is_online(*recipient).await.unwrap_or(false);
            if !online {
                continue;
            }

            if let Some(delivered_at) =
                mark_delivered(&self.db, unit.message_id, *recipient).await?
            {
                notify_delivered(
                    &self.bus,
                    unit.chat_id,
                    unit.message_id,
                    sender_id,
                    *recipient,
                    delivered_at,
                )
                .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_ms(0), 30_000);
        assert_eq!(backoff_ms(1), 30_000);
        assert_eq!(backoff_ms(2), 60_000);
        assert_eq!(backoff_ms(3), 120_000);
        assert_eq!(backoff_ms(4), 240_000);
        assert_eq!(backoff_ms(5), 480_000);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_ms(50), 480_000);
    }

    #[test]
    fn exhaustion_threshold_is_five_attempts() {
        assert!(!is_exhausted(4));
        assert!(is_exhausted(5));
        assert!(is_exhausted(6));
    }

    #[test]
    fn delivery_unit_roundtrips_through_json() {
        let unit = DeliveryUnit {
            message_id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            recipients: vec![Uuid::new_v4(), Uuid::new_v4()],
            attempt: 0,
            enqueued_at: Utc::now(),
        };

        let raw = serde_json::to_string(&unit).unwrap();
        assert!(raw.contains("messageId"), "wire format is camelCase");
        let parsed: DeliveryUnit = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, unit);
    }
}
