pub mod auth;
pub mod chats;
pub mod contacts;
pub mod messages;
pub mod shared;
pub mod users;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health — process liveness only. Always 200 while the process can
/// serve requests; dependency health lives under /health/ready.
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "messenger-server",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// GET /health/ready — readiness: database, KV store and object store must
/// all be reachable.
pub async fn health_ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = match state.db.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Readiness: database check failed");
            false
        }
    };

    let kv_ok = match state.kv.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Readiness: KV store check failed");
            false
        }
    };

    let storage_ok = match state
        .http_client
        .head(&state.config.storage_endpoint)
        .send()
        .await
    {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Readiness: object store probe failed");
            false
        }
    };

    let ready = db_ok && kv_ok && storage_ok;
    let http_status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if ready { "ok" } else { "degraded" },
            "database": if db_ok { "ok" } else { "unavailable" },
            "kv": if kv_ok { "ok" } else { "unavailable" },
            "storage": if storage_ok { "ok" } else { "unavailable" },
        })),
    )
}
