use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::kv::Kv;

// ============================================================================
// Channels
// ============================================================================

pub const CH_MESSAGE_NEW: &str = "message:new";
pub const CH_MESSAGE_EDIT: &str = "message:edit";
pub const CH_MESSAGE_DELETE: &str = "message:delete";
pub const CH_MESSAGE_REACTION: &str = "message:reaction";
pub const CH_USER_STATUS: &str = "user:status";
pub const CH_TYPING_START: &str = "typing:start";
pub const CH_TYPING_STOP: &str = "typing:stop";
pub const CH_READ_RECEIPT: &str = "read:receipt";
pub const CH_CHAT_UPDATE: &str = "chat:update";

/// Every channel a node subscribes to.
pub const ALL_CHANNELS: &[&str] = &[
    CH_MESSAGE_NEW,
    CH_MESSAGE_EDIT,
    CH_MESSAGE_DELETE,
    CH_MESSAGE_REACTION,
    CH_USER_STATUS,
    CH_TYPING_START,
    CH_TYPING_STOP,
    CH_READ_RECEIPT,
    CH_CHAT_UPDATE,
];

// ============================================================================
// Envelope
// ============================================================================

/// JSON envelope carried on every bus channel.
///
/// `origin` is the publishing node's ID; consumers that already emitted the
/// event to their local sockets skip their own envelopes to avoid duplicate
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub event: String,
    pub payload: Value,
    pub origin: Uuid,
}

impl BusEnvelope {
    /// True when this envelope was published by `node_id` itself.
    pub fn is_echo(&self, node_id: Uuid) -> bool {
        self.origin == node_id
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Thin fan-out layer over the fleet-wide broker.
///
/// Publishing is fire-and-forget: persistence is the source of truth and the
/// delivery queue guarantees eventual push, so a dropped publish costs only
/// latency. A failed publish is retried once, then logged.
#[derive(Clone)]
pub struct PubSubBridge {
    kv: Kv,
    node_id: Uuid,
}

impl PubSubBridge {
    pub fn new(kv: Kv, node_id: Uuid) -> Self {
        PubSubBridge { kv, node_id }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub async fn publish(&self, channel: &str, payload: Value) {
        let envelope = BusEnvelope {
            event: channel.to_owned(),
            payload,
            origin: self.node_id,
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(channel, error = ?e, "Failed to serialize bus envelope");
                return;
            }
        };

        let mut conn = self.kv.conn();
        if let Err(first) = conn.publish::<_, _, ()>(channel, &raw).await {
            // One retry absorbs transient broker hiccups; anything worse is
            // the queue's problem.
            if let Err(second) = conn.publish::<_, _, ()>(channel, &raw).await {
                tracing::warn!(
                    channel,
                    first = ?first,
                    second = ?second,
                    "Bus publish failed after retry; dropping event"
                );
            }
        }
    }
}

/// Subscribe to every bus channel and run `handler` for each envelope.
///
/// Runs until the process exits; a lost broker connection is re-established
/// with a fixed delay. Malformed envelopes are logged and skipped.
pub async fn run_subscriber<F, Fut>(kv: Kv, handler: F)
where
    F: Fn(BusEnvelope) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let mut pubsub = match kv.client().get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(error = ?e, "Bus subscriber connect failed; retrying in 2s");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let mut subscribed = true;
        for channel in ALL_CHANNELS.iter().copied() {
            if let Err(e) = pubsub.subscribe(channel).await {
                tracing::warn!(channel, error = ?e, "Bus subscribe failed; reconnecting");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }

        tracing::info!("Bus subscriber connected to {} channels", ALL_CHANNELS.len());

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let raw: String = match msg.get_payload() {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(error = ?e, "Non-string bus payload; skipping");
                    continue;
                }
            };

            match serde_json::from_str::<BusEnvelope>(&raw) {
                Ok(envelope) => handler(envelope).await,
                Err(e) => {
                    tracing::debug!(error = ?e, "Malformed bus envelope; skipping");
                }
            }
        }

        tracing::warn!("Bus subscriber stream ended; reconnecting in 2s");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_roundtrips_through_json() {
        let origin = Uuid::new_v4();
        let envelope = BusEnvelope {
            event: CH_MESSAGE_NEW.into(),
            payload: json!({ "messageId": "abc", "chatId": "def" }),
            origin,
        };

        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: BusEnvelope = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed.event, CH_MESSAGE_NEW);
        assert_eq!(parsed.payload["messageId"], "abc");
        assert_eq!(parsed.origin, origin);
    }

    #[test]
    fn echo_detection_matches_origin_only() {
        let node = Uuid::new_v4();
        let envelope = BusEnvelope {
            event: CH_TYPING_START.into(),
            payload: json!({}),
            origin: node,
        };

        assert!(envelope.is_echo(node));
        assert!(!envelope.is_echo(Uuid::new_v4()));
    }

    #[test]
    fn all_channels_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for channel in ALL_CHANNELS {
            assert!(seen.insert(channel), "duplicate channel {channel}");
        }
    }
}
