use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::chat::{fetch_message, require_participant};
use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::models::{ContentType, DeliveryRecord, MessageDto, MessageWithSender, Reaction};
use crate::pubsub::{
    PubSubBridge, CH_MESSAGE_DELETE, CH_MESSAGE_EDIT, CH_MESSAGE_NEW, CH_MESSAGE_REACTION,
    CH_READ_RECEIPT,
};
use crate::queue::{DeliveryQueue, DeliveryUnit};
use crate::socket::events::{
    EV_MESSAGE_DELETED, EV_MESSAGE_EDITED, EV_MESSAGE_NEW, EV_REACTION_ADDED, EV_REACTION_REMOVED,
};

/// Text ceiling after trimming.
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Soft-deleted messages keep a row with this placeholder content.
pub const DELETED_PLACEHOLDER: &str = "[Deleted]";

/// Reconnect flush cap per pass.
const FLUSH_LIMIT: i64 = 100;

const MESSAGE_DTO_COLUMNS: &str = "m.id, m.chat_id, m.sender_id, m.content, m.content_type, m.metadata, m.reply_to_id, \
     m.is_edited, m.edited_at, m.is_deleted, m.created_at, \
     u.username AS sender_username, u.display_name AS sender_display_name, \
     u.avatar_ref AS sender_avatar_ref";

// ============================================================================
// Broadcaster seam
// ============================================================================

/// Local socket emission, implemented by the socket manager.
///
/// The coordinator is constructed after the socket manager and depends only
/// on this trait, which keeps the dependency one-directional.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Emit to every local socket subscribed to the chat's room.
    async fn emit_to_chat(&self, chat_id: Uuid, event: &str, payload: Value);
    /// Emit to every local socket of one user.
    async fn emit_to_user(&self, user_id: Uuid, event: &str, payload: Value);
}

// ============================================================================
// Validation
// ============================================================================

/// Trim and bound message text. The empty check runs after the trim so
/// whitespace-only content is rejected too.
pub fn validate_content(content: &str) -> AppResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("EmptyContent".into()));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::BadRequest("ContentTooLarge".into()));
    }
    Ok(trimmed.to_owned())
}

pub fn validate_emoji(emoji: &str) -> AppResult<()> {
    let len = emoji.chars().count();
    if len == 0 || len > 10 {
        return Err(AppError::BadRequest("InvalidEmoji".into()));
    }
    Ok(())
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_type: Option<ContentType>,
    pub metadata: Option<Value>,
    pub reply_to_id: Option<Uuid>,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates the send path: persist message and delivery rows in one
/// transaction, then enqueue fan-out and publish.
///
/// Everything after the commit is fire-and-forget: persistence is the source
/// of truth, and the queue plus the reconnect flush guarantee eventual push
/// even when a publish is dropped.
#[derive(Clone)]
pub struct MessageCoordinator {
    db: Db,
    queue: DeliveryQueue,
    bus: PubSubBridge,
    broadcaster: Arc<dyn Broadcaster>,
}

impl MessageCoordinator {
    pub fn new(
        db: Db,
        queue: DeliveryQueue,
        bus: PubSubBridge,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        MessageCoordinator {
            db,
            queue,
            bus,
            broadcaster,
        }
    }

    /// Persist and fan out one message.
    ///
    /// The transaction covers the message row, one pending DeliveryRecord per
    /// recipient, the chat's `last_message_at`, and the recipients' unread
    /// counters. Nothing is externally visible if any step fails.
    pub async fn send(&self, dto: SendMessage) -> AppResult<MessageDto> {
        let content = validate_content(&dto.content)?;
        require_participant(self.db.writer(), dto.chat_id, dto.sender_id).await?;

        // A reply target must be a live message in the same chat.
        if let Some(reply_to_id) = dto.reply_to_id {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(
                     SELECT 1 FROM messages
                     WHERE id = $1 AND chat_id = $2 AND is_deleted = FALSE
                 )",
            )
            .bind(reply_to_id)
            .bind(dto.chat_id)
            .fetch_one(self.db.writer())
            .await?;

            if !exists {
                return Err(AppError::NotFound("Reply target message not found".into()));
            }
        }

        let content_type = dto.content_type.unwrap_or(ContentType::Text);
        let metadata = dto.metadata.unwrap_or_else(|| json!({}));

        let mut tx = self.db.writer().begin().await?;

        let (message_id, created_at): (Uuid, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO messages (chat_id, sender_id, content, content_type, metadata, reply_to_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, created_at",
        )
        .bind(dto.chat_id)
        .bind(dto.sender_id)
        .bind(&content)
        .bind(content_type.to_string())
        .bind(&metadata)
        .bind(dto.reply_to_id)
        .fetch_one(&mut *tx)
        .await?;

        let participants: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM participants WHERE chat_id = $1 AND left_at IS NULL",
        )
        .bind(dto.chat_id)
        .fetch_all(&mut *tx)
        .await?;

        let recipients: Vec<Uuid> = participants
            .into_iter()
            .filter(|id| *id != dto.sender_id)
            .collect();

        if !recipients.is_empty() {
            sqlx::query(
                "INSERT INTO delivery_records (message_id, user_id, status)
                 SELECT $1, unnest($2::uuid[]), 'pending'",
            )
            .bind(message_id)
            .bind(&recipients)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE participants SET unread_count = unread_count + 1
                 WHERE chat_id = $1 AND user_id = ANY($2) AND left_at IS NULL",
            )
            .bind(dto.chat_id)
            .bind(&recipients)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE chats SET last_message_at = $2 WHERE id = $1")
            .bind(dto.chat_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // The queue covers recipients the publish never reaches.
        let unit = DeliveryUnit {
            message_id,
            chat_id: dto.chat_id,
            recipients,
            attempt: 0,
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.queue.enqueue(&unit).await {
            tracing::warn!(
                message_id = %message_id,
                error = ?e,
                "Failed to enqueue delivery unit; reconnect flush will cover it"
            );
        }

        let message = self.fetch_dto(message_id).await?;
        let payload = serde_json::to_value(&message).unwrap_or_else(|_| json!({}));

        self.broadcaster
            .emit_to_chat(dto.chat_id, EV_MESSAGE_NEW, payload.clone())
            .await;
        self.bus.publish(CH_MESSAGE_NEW, payload).await;

        Ok(message)
    }

    /// Edit a message's content, preserving the prior content in the edit
    /// history.
    pub async fn edit(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> AppResult<MessageDto> {
        let content = validate_content(content)?;
        let message = fetch_message(self.db.writer(), message_id).await?;

        require_participant(self.db.writer(), message.chat_id, user_id).await?;
        if message.sender_id != Some(user_id) {
            return Err(AppError::Forbidden(
                "Only the sender can edit a message".into(),
            ));
        }

        let mut tx = self.db.writer().begin().await?;

        sqlx::query(
            "INSERT INTO edit_history (message_id, prior_content, edited_at)
             VALUES ($1, $2, NOW())",
        )
        .bind(message_id)
        .bind(&message.content)
        .execute(&mut *tx)
        .await?;

        // `is_deleted = FALSE` guards against editing a message soft-deleted
        // between the fetch above and this update.
        let edited_at: DateTime<Utc> = sqlx::query_scalar(
            "UPDATE messages SET content = $2, is_edited = TRUE, edited_at = NOW()
             WHERE id = $1 AND is_deleted = FALSE
             RETURNING edited_at",
        )
        .bind(message_id)
        .bind(&content)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;

        tx.commit().await?;

        let payload = json!({
            "messageId": message_id,
            "chatId": message.chat_id,
            "content": content,
            "editedAt": edited_at,
        });
        self.broadcaster
            .emit_to_chat(message.chat_id, EV_MESSAGE_EDITED, payload.clone())
            .await;
        self.bus.publish(CH_MESSAGE_EDIT, payload).await;

        self.fetch_dto(message_id).await
    }

    /// Soft-delete: the row stays, content becomes the placeholder.
    pub async fn delete(&self, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        let message = fetch_message(self.db.writer(), message_id).await?;

        require_participant(self.db.writer(), message.chat_id, user_id).await?;
        if message.sender_id != Some(user_id) {
            return Err(AppError::Forbidden(
                "Only the sender can delete a message".into(),
            ));
        }

        let result = sqlx::query(
            "UPDATE messages SET content = $2, is_deleted = TRUE, deleted_at = NOW()
             WHERE id = $1 AND is_deleted = FALSE",
        )
        .bind(message_id)
        .bind(DELETED_PLACEHOLDER)
        .execute(self.db.writer())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Message not found".into()));
        }

        let payload = json!({ "messageId": message_id, "chatId": message.chat_id });
        self.broadcaster
            .emit_to_chat(message.chat_id, EV_MESSAGE_DELETED, payload.clone())
            .await;
        self.bus.publish(CH_MESSAGE_DELETE, payload).await;

        Ok(())
    }

    /// Mark one message read by `user_id` and notify the sender.
    ///
    /// `pending → read` is allowed (the recipient read before the delivery
    /// worker visited); `delivered_at` is backfilled in that case. Repeat
    /// reads are idempotent and emit nothing. Only recipients hold a record;
    /// a sender reading their own message gets `NotFound`.
    pub async fn mark_read(&self, user_id: Uuid, message_id: Uuid) -> AppResult<DeliveryRecord> {
        let message = fetch_message(self.db.writer(), message_id).await?;
        require_participant(self.db.writer(), message.chat_id, user_id).await?;

        let transitioned: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE delivery_records
             SET status = 'read', read_at = NOW(),
                 delivered_at = COALESCE(delivered_at, NOW())
             WHERE message_id = $1 AND user_id = $2 AND status <> 'read'
             RETURNING read_at",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(self.db.writer())
        .await?;

        let record = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT message_id, user_id, status, delivered_at, read_at
             FROM delivery_records
             WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(self.db.writer())
        .await?
        .ok_or_else(|| AppError::NotFound("Delivery record not found".into()))?;

        self.recount_unread(message.chat_id, user_id).await?;

        if let (Some(read_at), Some(sender_id)) = (transitioned, message.sender_id) {
            self.bus
                .publish(
                    CH_READ_RECEIPT,
                    json!({
                        "kind": "read",
                        "messageId": message_id,
                        "chatId": message.chat_id,
                        "readBy": user_id,
                        "senderId": sender_id,
                        "readAt": read_at,
                    }),
                )
                .await;
        }

        Ok(record)
    }

    /// Bulk-read every outstanding record for the user in one chat.
    pub async fn mark_all_read(&self, user_id: Uuid, chat_id: Uuid) -> AppResult<u64> {
        require_participant(self.db.writer(), chat_id, user_id).await?;

        let result = sqlx::query(
            "UPDATE delivery_records dr
             SET status = 'read', read_at = NOW(),
                 delivered_at = COALESCE(dr.delivered_at, NOW())
             FROM messages m
             WHERE m.id = dr.message_id AND m.chat_id = $1
               AND dr.user_id = $2 AND dr.status <> 'read'",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(self.db.writer())
        .await?;

        sqlx::query(
            "UPDATE participants SET unread_count = 0 WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(self.db.writer())
        .await?;

        Ok(result.rows_affected())
    }

    /// Add a reaction. Idempotent: re-adding the same emoji returns the
    /// existing row without broadcasting again.
    pub async fn add_reaction(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> AppResult<Reaction> {
        validate_emoji(emoji)?;
        let message = fetch_message(self.db.writer(), message_id).await?;
        require_participant(self.db.writer(), message.chat_id, user_id).await?;

        let inserted = sqlx::query_as::<_, Reaction>(
            "INSERT INTO reactions (message_id, user_id, emoji)
             VALUES ($1, $2, $3)
             ON CONFLICT (message_id, user_id, emoji) DO NOTHING
             RETURNING id, message_id, user_id, emoji, created_at",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .fetch_optional(self.db.writer())
        .await?;

        let (reaction, fresh) = match inserted {
            Some(reaction) => (reaction, true),
            None => {
                let existing = sqlx::query_as::<_, Reaction>(
                    "SELECT id, message_id, user_id, emoji, created_at
                     FROM reactions
                     WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
                )
                .bind(message_id)
                .bind(user_id)
                .bind(emoji)
                .fetch_one(self.db.writer())
                .await?;
                (existing, false)
            }
        };

        if fresh {
            let payload = json!({
                "messageId": message_id,
                "chatId": message.chat_id,
                "reactionId": reaction.id,
                "userId": user_id,
                "emoji": emoji,
            });
            self.broadcaster
                .emit_to_chat(message.chat_id, EV_REACTION_ADDED, payload.clone())
                .await;
            self.bus
                .publish(
                    CH_MESSAGE_REACTION,
                    json!({ "action": "added", "payload": payload }),
                )
                .await;
        }

        Ok(reaction)
    }

    /// Remove the caller's own reaction.
    pub async fn remove_reaction(&self, user_id: Uuid, reaction_id: Uuid) -> AppResult<()> {
        let removed: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM reactions WHERE id = $1 AND user_id = $2 RETURNING message_id",
        )
        .bind(reaction_id)
        .bind(user_id)
        .fetch_optional(self.db.writer())
        .await?;

        let message_id = removed.ok_or_else(|| AppError::NotFound("Reaction not found".into()))?;

        let chat_id: Uuid = sqlx::query_scalar("SELECT chat_id FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_one(self.db.writer())
            .await?;

        let payload = json!({
            "reactionId": reaction_id,
            "messageId": message_id,
            "chatId": chat_id,
        });
        self.broadcaster
            .emit_to_chat(chat_id, EV_REACTION_REMOVED, payload.clone())
            .await;
        self.bus
            .publish(
                CH_MESSAGE_REACTION,
                json!({ "action": "removed", "payload": payload }),
            )
            .await;

        Ok(())
    }

    /// Undelivered messages for a freshly-connected user, oldest first,
    /// marked `delivered` in the same pass. The caller emits them before the
    /// socket is considered ready.
    pub async fn flush_undelivered(&self, user_id: Uuid) -> AppResult<Vec<MessageDto>> {
        let rows = sqlx::query_as::<_, MessageWithSender>(&format!(
            "SELECT {MESSAGE_DTO_COLUMNS}
             FROM delivery_records dr
             JOIN messages m ON m.id = dr.message_id
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE dr.user_id = $1 AND dr.status = 'pending' AND m.is_deleted = FALSE
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT $2"
        ))
        .bind(user_id)
        .bind(FLUSH_LIMIT)
        .fetch_all(self.db.writer())
        .await?;

        let mut flushed = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(delivered_at) = mark_delivered(&self.db, row.id, user_id).await? {
                notify_delivered(
                    &self.bus,
                    row.chat_id,
                    row.id,
                    row.sender_id,
                    user_id,
                    delivered_at,
                )
                .await;
            }
            flushed.push(MessageDto::from(row));
        }

        Ok(flushed)
    }

    async fn recount_unread(&self, chat_id: Uuid, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE participants SET unread_count = (
                 SELECT COUNT(*)::int FROM delivery_records dr
                 JOIN messages m ON m.id = dr.message_id
                 WHERE dr.user_id = $2 AND m.chat_id = $1 AND dr.status <> 'read'
             )
             WHERE chat_id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(self.db.writer())
        .await?;
        Ok(())
    }

    async fn fetch_dto(&self, message_id: Uuid) -> AppResult<MessageDto> {
        let row = sqlx::query_as::<_, MessageWithSender>(&format!(
            "SELECT {MESSAGE_DTO_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.id = $1"
        ))
        .bind(message_id)
        .fetch_optional(self.db.writer())
        .await?
        .ok_or_else(|| AppError::NotFound("Message not found".into()))?;

        Ok(MessageDto::from(row))
    }
}

// ============================================================================
// Delivery status helpers (shared with the queue workers)
// ============================================================================

/// Guarded `pending → delivered` transition. Returns the timestamp on a real
/// transition, `None` when the record was already delivered or read — the
/// status machine never regresses.
pub async fn mark_delivered(
    db: &Db,
    message_id: Uuid,
    user_id: Uuid,
) -> AppResult<Option<DateTime<Utc>>> {
    let delivered_at = sqlx::query_scalar(
        "UPDATE delivery_records SET status = 'delivered', delivered_at = NOW()
         WHERE message_id = $1 AND user_id = $2 AND status = 'pending'
         RETURNING delivered_at",
    )
    .bind(message_id)
    .bind(user_id)
    .fetch_optional(db.writer())
    .await?;

    Ok(delivered_at)
}

/// Tell the sender a recipient received the message. Rides the `read:receipt`
/// bus channel (with a `kind` discriminator); every node, including this one,
/// emits to the sender's local sockets from its subscriber.
pub async fn notify_delivered(
    bus: &PubSubBridge,
    chat_id: Uuid,
    message_id: Uuid,
    sender_id: Option<Uuid>,
    recipient: Uuid,
    delivered_at: DateTime<Utc>,
) {
    // System messages have no sender to notify.
    let Some(sender_id) = sender_id else {
        return;
    };

    bus.publish(
        CH_READ_RECEIPT,
        json!({
            "kind": "delivered",
            "messageId": message_id,
            "chatId": chat_id,
            "userId": recipient,
            "senderId": sender_id,
            "deliveredAt": delivered_at,
        }),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed() {
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(matches!(
            validate_content("   "),
            Err(AppError::BadRequest(msg)) if msg == "EmptyContent"
        ));
    }

    #[test]
    fn content_at_the_ceiling_is_accepted() {
        let content = "x".repeat(MAX_CONTENT_CHARS);
        assert_eq!(validate_content(&content).unwrap().len(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn oversized_content_is_rejected() {
        let content = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            validate_content(&content),
            Err(AppError::BadRequest(msg)) if msg == "ContentTooLarge"
        ));
    }

    #[test]
    fn content_limit_counts_chars_not_bytes() {
        // 10,000 four-byte scalars are within the limit.
        let content = "🦀".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&content).is_ok());
    }

    #[test]
    fn emoji_bounds() {
        assert!(validate_emoji("👍").is_ok());
        assert!(validate_emoji("👍👍👍👍👍👍👍👍👍👍").is_ok());
        assert!(validate_emoji("").is_err());
        assert!(validate_emoji("👍👍👍👍👍👍👍👍👍👍👍").is_err());
    }

    #[test]
    fn deleted_placeholder_is_the_literal() {
        assert_eq!(DELETED_PLACEHOLDER, "[Deleted]");
    }
}
