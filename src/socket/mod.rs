pub mod events;
pub mod handler;
pub mod manager;

pub use handler::websocket_handler;
pub use manager::SocketManager;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::chat::co_participant_ids;
use crate::pubsub::{
    BusEnvelope, CH_CHAT_UPDATE, CH_MESSAGE_DELETE, CH_MESSAGE_EDIT, CH_MESSAGE_NEW,
    CH_MESSAGE_REACTION, CH_READ_RECEIPT, CH_TYPING_START, CH_TYPING_STOP, CH_USER_STATUS,
};
use crate::state::AppState;
use events::{
    EV_MESSAGE_DELETED, EV_MESSAGE_DELIVERED, EV_MESSAGE_EDITED, EV_MESSAGE_NEW, EV_MESSAGE_READ,
    EV_REACTION_ADDED, EV_REACTION_REMOVED, EV_TYPING_START, EV_TYPING_STOP, EV_USER_STATUS,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatScoped {
    chat_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionEnvelope {
    action: String,
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusScoped {
    user_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptScoped {
    kind: String,
    sender_id: Uuid,
    #[serde(flatten)]
    rest: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatUpdate {
    chat_id: Uuid,
    action: String,
    user_ids: Vec<Uuid>,
}

/// Apply one bus envelope to this node's sockets.
///
/// Message-flavored channels were already emitted locally by the publishing
/// node's coordinator, so their echoes are skipped. Presence, typing, read
/// receipts and chat updates are emitted *only* from here — every node,
/// including the origin, runs the same code path.
pub async fn handle_bus_event(state: &AppState, envelope: BusEnvelope) {
    let node_id = state.bus.node_id();

    match envelope.event.as_str() {
        CH_MESSAGE_NEW | CH_MESSAGE_EDIT | CH_MESSAGE_DELETE => {
            if envelope.is_echo(node_id) {
                return;
            }
            let Ok(scoped) = serde_json::from_value::<ChatScoped>(envelope.payload.clone()) else {
                return;
            };
            let event = match envelope.event.as_str() {
                CH_MESSAGE_NEW => EV_MESSAGE_NEW,
                CH_MESSAGE_EDIT => EV_MESSAGE_EDITED,
                _ => EV_MESSAGE_DELETED,
            };
            state
                .sockets
                .emit_to_chat(scoped.chat_id, event, envelope.payload)
                .await;
        }

        CH_MESSAGE_REACTION => {
            if envelope.is_echo(node_id) {
                return;
            }
            let Ok(reaction) = serde_json::from_value::<ReactionEnvelope>(envelope.payload) else {
                return;
            };
            let Ok(scoped) = serde_json::from_value::<ChatScoped>(reaction.payload.clone()) else {
                return;
            };
            let event = if reaction.action == "added" {
                EV_REACTION_ADDED
            } else {
                EV_REACTION_REMOVED
            };
            state
                .sockets
                .emit_to_chat(scoped.chat_id, event, reaction.payload)
                .await;
        }

        CH_USER_STATUS => {
            let Ok(scoped) = serde_json::from_value::<StatusScoped>(envelope.payload.clone())
            else {
                return;
            };
            // Fan out to everyone who shares a chat with this user, the same
            // audience that sees their messages.
            match co_participant_ids(state.db.writer(), scoped.user_id).await {
                Ok(audience) => {
                    state
                        .sockets
                        .emit_to_users(&audience, EV_USER_STATUS, envelope.payload)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %scoped.user_id,
                        error = ?e,
                        "Failed to resolve presence audience; status event not delivered"
                    );
                }
            }
        }

        CH_TYPING_START | CH_TYPING_STOP => {
            let Ok(scoped) = serde_json::from_value::<ChatScoped>(envelope.payload.clone()) else {
                return;
            };
            let event = if envelope.event == CH_TYPING_START {
                EV_TYPING_START
            } else {
                EV_TYPING_STOP
            };
            state
                .sockets
                .emit_to_chat(scoped.chat_id, event, envelope.payload)
                .await;
        }

        CH_READ_RECEIPT => {
            let Ok(receipt) = serde_json::from_value::<ReceiptScoped>(envelope.payload) else {
                return;
            };
            let event = if receipt.kind == "delivered" {
                EV_MESSAGE_DELIVERED
            } else {
                EV_MESSAGE_READ
            };
            state
                .sockets
                .emit_to_user(receipt.sender_id, event, receipt.rest)
                .await;
        }

        CH_CHAT_UPDATE => {
            let Ok(update) = serde_json::from_value::<ChatUpdate>(envelope.payload) else {
                return;
            };
            // Keep local rooms in sync with participant changes.
            for user_id in update.user_ids {
                if update.action == "left" {
                    state
                        .sockets
                        .remove_user_from_room(update.chat_id, user_id)
                        .await;
                } else {
                    state
                        .sockets
                        .join_user_to_room(update.chat_id, user_id)
                        .await;
                }
            }
        }

        other => {
            tracing::debug!(channel = other, "Unhandled bus channel");
        }
    }
}
