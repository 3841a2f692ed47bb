use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::{Display, EnumString};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================
//
// Stored as TEXT columns; `Display`/`EnumString` give the canonical lowercase
// spelling for binds and parses.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    System,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Accepted,
    Blocked,
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    #[serde(skip)]
    pub password_hash: String,
    pub avatar_ref: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile shape used in API responses and socket payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        UserDto {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            avatar_ref: user.avatar_ref,
            status: user.status,
            last_seen: user.last_seen,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 hex digest of the refresh credential. At most one active row
    /// per token.
    pub session_token: String,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Live socket currently attached to this session, if any. Never outlives
    /// the socket itself.
    pub socket_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Optional device metadata captured at login.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub device_name: Option<String>,
    #[serde(skip)]
    pub ip_address: Option<String>,
    #[serde(skip)]
    pub user_agent: Option<String>,
}

// ============================================================================
// Chat & Participant
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub chat_type: String,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub owner_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub unread_count: i32,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    /// NULL for system messages.
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Message row joined with its sender's public profile, as carried by
/// `message:new` and the paged history endpoint.
#[derive(Debug, Clone, FromRow)]
pub struct MessageWithSender {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub sender_username: Option<String>,
    pub sender_display_name: Option<String>,
    pub sender_avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender: Option<MessageSenderDto>,
    pub content: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub reply_to_id: Option<Uuid>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSenderDto {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl From<MessageWithSender> for MessageDto {
    fn from(row: MessageWithSender) -> Self {
        let sender = match (row.sender_id, row.sender_username, row.sender_display_name) {
            (Some(id), Some(username), Some(display_name)) => Some(MessageSenderDto {
                id,
                username,
                display_name,
                avatar_ref: row.sender_avatar_ref,
            }),
            _ => None,
        };

        MessageDto {
            id: row.id,
            chat_id: row.chat_id,
            sender,
            content: row.content,
            content_type: row.content_type,
            metadata: row.metadata,
            reply_to_id: row.reply_to_id,
            is_edited: row.is_edited,
            edited_at: row.edited_at,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// DeliveryRecord & Reaction
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Contact
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub requested_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enums_roundtrip_their_lowercase_spelling() {
        assert_eq!(DeliveryStatus::Pending.to_string(), "pending");
        assert_eq!(DeliveryStatus::from_str("read").unwrap(), DeliveryStatus::Read);
        assert_eq!(ChatType::Direct.to_string(), "direct");
        assert_eq!(ChatType::from_str("group").unwrap(), ChatType::Group);
        assert_eq!(PresenceStatus::Away.to_string(), "away");
        assert!(PresenceStatus::from_str("busy").is_err());
    }

    #[test]
    fn delivery_status_ordering_matches_lifecycle() {
        assert!(DeliveryStatus::Pending < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }

    #[test]
    fn message_dto_carries_sender_profile() {
        let sender_id = Uuid::new_v4();
        let row = MessageWithSender {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Some(sender_id),
            content: "hi".into(),
            content_type: "text".into(),
            metadata: serde_json::json!({}),
            reply_to_id: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: Utc::now(),
            sender_username: Some("alice".into()),
            sender_display_name: Some("Alice".into()),
            sender_avatar_ref: None,
        };

        let dto = MessageDto::from(row);
        let sender = dto.sender.expect("sender profile should be present");
        assert_eq!(sender.id, sender_id);
        assert_eq!(sender.username, "alice");
    }

    #[test]
    fn system_message_dto_has_no_sender() {
        let row = MessageWithSender {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: None,
            content: "carol joined the chat".into(),
            content_type: "system".into(),
            metadata: serde_json::json!({}),
            reply_to_id: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: Utc::now(),
            sender_username: None,
            sender_display_name: None,
            sender_avatar_ref: None,
        };

        assert!(MessageDto::from(row).sender.is_none());
    }

    #[test]
    fn user_dto_serializes_camel_case() {
        let dto = UserDto {
            id: Uuid::new_v4(),
            username: "alice".into(),
            display_name: "Alice".into(),
            avatar_ref: None,
            status: "online".into(),
            last_seen: None,
        };

        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("displayName").is_some());
        assert!(json.get("display_name").is_none());
    }
}
