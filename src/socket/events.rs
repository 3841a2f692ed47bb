use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{ContentType, PresenceStatus};

/// Envelope for all socket frames (both directions):
/// `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Serialize an outbound frame. Serialization of a `Value` cannot fail.
pub fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

// ── Inbound event names ───────────────────────────────────────────────────────

pub const EV_MESSAGE_SEND: &str = "message:send";
pub const EV_MESSAGE_EDIT: &str = "message:edit";
pub const EV_MESSAGE_DELETE: &str = "message:delete";
pub const EV_MESSAGE_READ: &str = "message:read";
pub const EV_CHAT_MARK_ALL_READ: &str = "chat:mark-all-read";
pub const EV_REACTION_ADD: &str = "reaction:add";
pub const EV_REACTION_REMOVE: &str = "reaction:remove";
pub const EV_TYPING_START: &str = "typing:start";
pub const EV_TYPING_STOP: &str = "typing:stop";
pub const EV_PRESENCE_UPDATE: &str = "presence:update";
pub const EV_PRESENCE_HEARTBEAT: &str = "presence:heartbeat";

// ── Outbound event names ──────────────────────────────────────────────────────

pub const EV_CONNECTION_SUCCESS: &str = "connection:success";
pub const EV_MESSAGE_NEW: &str = "message:new";
pub const EV_MESSAGE_SENT: &str = "message:sent";
pub const EV_MESSAGE_ERROR: &str = "message:error";
pub const EV_MESSAGE_EDITED: &str = "message:edited";
pub const EV_MESSAGE_DELETED: &str = "message:deleted";
pub const EV_MESSAGE_DELIVERED: &str = "message:delivered";
pub const EV_REACTION_ADDED: &str = "reaction:added";
pub const EV_REACTION_REMOVED: &str = "reaction:removed";
pub const EV_REACTION_ERROR: &str = "reaction:error";
pub const EV_USER_STATUS: &str = "user.status";
pub const EV_SERVER_SHUTDOWN: &str = "server:shutdown";

// ── Inbound payloads ──────────────────────────────────────────────────────────

/// First frame of a handshake that did not pass the token as a query
/// parameter: `{"auth": {"token": "..."}}`.
#[derive(Debug, Deserialize)]
pub struct AuthFrame {
    pub auth: AuthObject,
}

#[derive(Debug, Deserialize)]
pub struct AuthObject {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub chat_id: Uuid,
    pub content: String,
    pub content_type: Option<ContentType>,
    pub metadata: Option<Value>,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    pub message_id: Uuid,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefPayload {
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRefPayload {
    pub chat_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionAddPayload {
    pub message_id: Uuid,
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRemovePayload {
    pub reaction_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PresenceUpdatePayload {
    pub status: PresenceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wraps_event_and_data() {
        let raw = frame(EV_CONNECTION_SUCCESS, json!({ "userId": "abc" }));
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["event"], "connection:success");
        assert_eq!(parsed["data"]["userId"], "abc");
    }

    #[test]
    fn envelope_parses_with_and_without_data() {
        let with: Envelope =
            serde_json::from_str(r#"{"event":"typing:start","data":{"chatId":"x"}}"#).unwrap();
        assert_eq!(with.event, "typing:start");
        assert_eq!(with.data["chatId"], "x");

        let without: Envelope = serde_json::from_str(r#"{"event":"presence:heartbeat"}"#).unwrap();
        assert_eq!(without.event, "presence:heartbeat");
        assert!(without.data.is_null());
    }

    #[test]
    fn send_payload_parses_camel_case() {
        let chat_id = Uuid::new_v4();
        let payload: SendPayload = serde_json::from_value(json!({
            "chatId": chat_id,
            "content": "hi",
        }))
        .unwrap();

        assert_eq!(payload.chat_id, chat_id);
        assert_eq!(payload.content, "hi");
        assert!(payload.content_type.is_none());
        assert!(payload.reply_to_id.is_none());
    }

    #[test]
    fn auth_frame_parses_handshake_shape() {
        let parsed: AuthFrame =
            serde_json::from_str(r#"{"auth":{"token":"jwt-goes-here"}}"#).unwrap();
        assert_eq!(parsed.auth.token, "jwt-goes-here");
    }

    #[test]
    fn presence_update_rejects_unknown_status() {
        assert!(serde_json::from_value::<PresenceUpdatePayload>(json!({ "status": "away" })).is_ok());
        assert!(
            serde_json::from_value::<PresenceUpdatePayload>(json!({ "status": "busy" })).is_err()
        );
    }
}
