//! Protocol-level tests for the gateway: frame shapes, fan-out semantics of
//! the socket manager, and the credential rules the handshake relies on.
//! These run against the library's public surface and need no external
//! services.

use serde_json::{json, Value};
use uuid::Uuid;

use messenger_server::auth::{
    create_access_token, create_refresh_token, hash_session_token, validate_token, CredentialError,
    TokenType,
};
use messenger_server::messages::Broadcaster;
use messenger_server::pubsub::BusEnvelope;
use messenger_server::socket::events::{frame, Envelope, EV_MESSAGE_NEW, EV_USER_STATUS};
use messenger_server::socket::SocketManager;

const ACCESS_SECRET: &str = "integration-access-secret-32-chars!!";
const REFRESH_SECRET: &str = "integration-refresh-secret-32-chars!";

fn parse(raw: &str) -> Value {
    serde_json::from_str(raw).expect("frame should be valid JSON")
}

// ============================================================================
// Wire format
// ============================================================================

#[test]
fn outbound_frames_follow_the_envelope_shape() {
    let raw = frame(
        "connection:success",
        json!({ "userId": Uuid::new_v4(), "timestamp": "2026-01-01T00:00:00Z" }),
    );
    let value = parse(&raw);

    assert_eq!(value["event"], "connection:success");
    assert!(value["data"]["userId"].is_string());
    assert!(value["data"]["timestamp"].is_string());
}

#[test]
fn outbound_frames_parse_back_as_envelopes() {
    let raw = frame(EV_USER_STATUS, json!({ "status": "online" }));
    let envelope: Envelope = serde_json::from_str(&raw).unwrap();

    assert_eq!(envelope.event, EV_USER_STATUS);
    assert_eq!(envelope.data["status"], "online");
}

#[test]
fn bus_envelopes_carry_event_payload_and_origin() {
    let origin = Uuid::new_v4();
    let raw = serde_json::to_string(&BusEnvelope {
        event: "message:new".into(),
        payload: json!({ "chatId": Uuid::new_v4() }),
        origin,
    })
    .unwrap();

    let parsed: BusEnvelope = serde_json::from_str(&raw).unwrap();
    assert!(parsed.is_echo(origin));
    assert!(!parsed.is_echo(Uuid::new_v4()));
}

// ============================================================================
// Fan-out semantics
// ============================================================================

#[tokio::test]
async fn chat_room_fanout_reaches_every_participant_device() {
    let manager = SocketManager::new();
    let chat = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    // Alice on two devices, bob on one.
    let alice_phone = Uuid::new_v4();
    let alice_laptop = Uuid::new_v4();
    let bob_phone = Uuid::new_v4();

    let mut rx_alice_phone = manager.register(alice_phone, alice).await;
    let mut rx_alice_laptop = manager.register(alice_laptop, alice).await;
    let mut rx_bob = manager.register(bob_phone, bob).await;

    manager.join_room(chat, alice_phone).await;
    manager.join_room(chat, alice_laptop).await;
    manager.join_room(chat, bob_phone).await;

    manager
        .emit_to_chat(chat, EV_MESSAGE_NEW, json!({ "content": "hi" }))
        .await;

    for rx in [&mut rx_alice_phone, &mut rx_alice_laptop, &mut rx_bob] {
        let value = parse(&rx.recv().await.expect("frame expected"));
        assert_eq!(value["event"], "message:new");
        assert_eq!(value["data"]["content"], "hi");
    }
}

#[tokio::test]
async fn broadcaster_seam_matches_direct_emission() {
    let manager = SocketManager::new();
    let chat = Uuid::new_v4();
    let user = Uuid::new_v4();
    let socket = Uuid::new_v4();

    let mut rx = manager.register(socket, user).await;
    manager.join_room(chat, socket).await;

    // The coordinator only sees this trait; it must behave like the manager.
    let broadcaster: &dyn Broadcaster = &manager;
    broadcaster
        .emit_to_chat(chat, EV_MESSAGE_NEW, json!({ "via": "seam" }))
        .await;
    broadcaster
        .emit_to_user(user, "message:delivered", json!({ "via": "seam" }))
        .await;

    assert_eq!(parse(&rx.recv().await.unwrap())["event"], "message:new");
    assert_eq!(
        parse(&rx.recv().await.unwrap())["event"],
        "message:delivered"
    );
}

#[tokio::test]
async fn disconnected_sockets_never_receive_room_traffic() {
    let manager = SocketManager::new();
    let chat = Uuid::new_v4();
    let user = Uuid::new_v4();
    let socket = Uuid::new_v4();

    let mut rx = manager.register(socket, user).await;
    manager.join_room(chat, socket).await;
    manager.unregister(socket).await;

    manager
        .emit_to_chat(chat, EV_MESSAGE_NEW, json!({ "content": "late" }))
        .await;

    assert!(rx.try_recv().is_err());
}

// ============================================================================
// Handshake credential rules
// ============================================================================

#[test]
fn access_tokens_validate_and_carry_the_session() {
    let user_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let token =
        create_access_token(user_id, "alice".into(), session_id, ACCESS_SECRET).unwrap();

    let claims = validate_token(&token, ACCESS_SECRET, TokenType::Access).unwrap();
    assert_eq!(claims.user_id().unwrap(), user_id);
    assert_eq!(claims.sid, session_id);
}

#[test]
fn refresh_tokens_are_rejected_on_the_gateway() {
    // A refresh token is signed with a different secret AND a different type;
    // either alone must fail access validation.
    let refresh = create_refresh_token(
        Uuid::new_v4(),
        "alice".into(),
        Uuid::new_v4(),
        REFRESH_SECRET,
    )
    .unwrap();

    assert_eq!(
        validate_token(&refresh, ACCESS_SECRET, TokenType::Access),
        Err(CredentialError::Invalid)
    );
    assert_eq!(
        validate_token(&refresh, REFRESH_SECRET, TokenType::Access),
        Err(CredentialError::Invalid)
    );
}

#[test]
fn session_digest_is_stable_for_cache_keys() {
    let refresh = create_refresh_token(
        Uuid::new_v4(),
        "bob".into(),
        Uuid::new_v4(),
        REFRESH_SECRET,
    )
    .unwrap();

    let d1 = hash_session_token(&refresh);
    let d2 = hash_session_token(&refresh);
    assert_eq!(d1, d2);
    assert_eq!(d1.len(), 64);
}
