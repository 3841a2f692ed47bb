use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use messenger_server::config::Config;
use messenger_server::db::Db;
use messenger_server::kv::Kv;
use messenger_server::messages::MessageCoordinator;
use messenger_server::presence::PresenceRegistry;
use messenger_server::pubsub::{self, PubSubBridge};
use messenger_server::queue::{DeliveryQueue, DeliveryWorker};
use messenger_server::ratelimit::{self, RateLimiter};
use messenger_server::scheduler::{Job, Scheduler};
use messenger_server::session::SessionStore;
use messenger_server::socket::{self, events::EV_SERVER_SHUTDOWN, SocketManager};
use messenger_server::state::AppState;
use messenger_server::typing::TypingTracker;
use messenger_server::{error::AppError, handlers};

/// Interval between heartbeat sweeps; sockets lapse after 60 s without a
/// heartbeat, so sweeping at a quarter of that keeps detection timely.
const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Fleet-wide per-IP request budget (the `api` bucket in the KV store), on
/// top of the purely local governor layer. Health and metrics are exempt.
/// Fails open when the KV store is unreachable — rate limiting must never be
/// the thing that takes the API down.
async fn fleet_rate_limit(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path.starts_with("/health") || path == "/metrics" {
        return next.run(req).await;
    }
    let Some(ConnectInfo(addr)) = connect_info else {
        return next.run(req).await;
    };

    match state
        .limiter
        .allow(&ratelimit::API, &addr.ip().to_string())
        .await
    {
        Ok(decision) if decision.ok => next.run(req).await,
        Ok(decision) => AppError::RateLimited {
            retry_after_ms: decision.retry_after_ms,
        }
        .into_response(),
        Err(e) => {
            tracing::warn!(error = ?e, "Fleet rate limit check failed; allowing request");
            next.run(req).await
        }
    }
}

#[tokio::main]
async fn main() {
    // Load configuration first — an invalid environment must fail before any
    // dependency is touched.
    let config = Config::from_env().expect("Failed to load configuration");

    // Initialize tracing — JSON in production, human-readable in dev.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "messenger_server={},tower_http=info,sqlx=warn",
            config.log_level
        )
        .parse()
        .expect("log filter is valid")
    });

    if config.is_dev {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }

    info!("🚀 Messenger server starting...");

    let node_id = Uuid::new_v4();
    info!(node_id = %node_id, "Node identity assigned");

    let db = Db::connect(
        &config.database_url,
        config.database_replica_url.as_deref(),
    )
    .await
    .expect("Failed to create database pools");

    db.health_check()
        .await
        .expect("Database health check failed");
    info!("✅ Database reachable");

    let kv = Kv::connect(&config.redis_url)
        .await
        .expect("Failed to connect to KV store");
    kv.health_check().await.expect("KV store health check failed");
    info!("✅ KV store reachable");

    // Core components, leaves first.
    let bus = PubSubBridge::new(kv.clone(), node_id);
    let (scheduler, scheduler_runner) = Scheduler::new();
    let sessions = SessionStore::new(db.clone(), kv.clone());
    let presence = PresenceRegistry::new(
        kv.clone(),
        db.clone(),
        bus.clone(),
        scheduler.clone(),
        Duration::from_secs(config.offline_grace_secs),
    );
    let typing = TypingTracker::new(kv.clone(), bus.clone());
    let limiter = RateLimiter::new(kv.clone());
    let queue = DeliveryQueue::new(kv.clone());
    queue
        .ensure_group()
        .await
        .expect("Failed to create delivery consumer group");

    let sockets = SocketManager::new();
    // The coordinator sees the socket manager only as a Broadcaster, which
    // keeps the dependency one-directional.
    let coordinator = MessageCoordinator::new(
        db.clone(),
        queue.clone(),
        bus.clone(),
        Arc::new(sockets.clone()),
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client");

    let app_state = AppState {
        config: Arc::new(config.clone()),
        db: db.clone(),
        kv: kv.clone(),
        sessions,
        presence: presence.clone(),
        typing,
        limiter,
        bus,
        coordinator,
        sockets: sockets.clone(),
        scheduler: scheduler.clone(),
        http_client,
    };

    // ── Background tasks ──────────────────────────────────────────────────────

    // Scheduler loop: grace windows and the heartbeat sweep.
    {
        let state = app_state.clone();
        tokio::spawn(scheduler_runner.run(move |job| {
            let state = state.clone();
            async move {
                match job {
                    Job::OfflineGrace { user_id } => {
                        tokio::spawn(async move {
                            if let Err(e) = state.presence.finalize_offline(user_id).await {
                                tracing::warn!(user_id = %user_id, error = ?e, "Offline finalize failed");
                            }
                        });
                    }
                    Job::HeartbeatSweep => {
                        state
                            .scheduler
                            .schedule(Job::HeartbeatSweep, HEARTBEAT_SWEEP_INTERVAL);
                        tokio::spawn(async move {
                            // Force-close lapsed sockets; the connection task's
                            // cleanup performs the actual detach exactly once.
                            for (user_id, socket_id) in state.presence.stale_sockets().await {
                                tracing::info!(
                                    user_id = %user_id,
                                    socket_id = %socket_id,
                                    "Heartbeat lapsed; closing socket"
                                );
                                state.sockets.unregister(socket_id).await;
                            }
                        });
                    }
                }
            }
        }));
        scheduler.schedule(Job::HeartbeatSweep, HEARTBEAT_SWEEP_INTERVAL);
    }

    // Bus subscriber: applies fleet events to local sockets.
    {
        let state = app_state.clone();
        tokio::spawn(pubsub::run_subscriber(kv.clone(), move |envelope| {
            let state = state.clone();
            async move {
                socket::handle_bus_event(&state, envelope).await;
            }
        }));
    }

    // Delivery workers.
    for i in 0..config.delivery_workers {
        let worker = DeliveryWorker {
            queue: queue.clone(),
            db: db.clone(),
            presence: presence.clone(),
            bus: app_state.bus.clone(),
            consumer: format!("{node_id}-{i}"),
        };
        tokio::spawn(worker.run());
    }
    info!("👷 {} delivery workers started", config.delivery_workers);

    // ── HTTP surface ──────────────────────────────────────────────────────────

    // CORS: permissive in dev, restricted to the frontend origin in production.
    let cors = if config.is_dev {
        info!("🔓 CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origin: Option<HeaderValue> = config.frontend_origin.parse().ok();
        match origin {
            Some(origin) => {
                info!("🔒 CORS: allowing origin {}", config.frontend_origin);
                CorsLayer::new()
                    .allow_origin(AllowOrigin::exact(origin))
                    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                    .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            }
            None => {
                tracing::warn!("🔒 CORS: FRONTEND_ORIGIN unparseable — denying cross-origin requests");
                CorsLayer::new()
            }
        }
    };

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    // Local per-IP throttle: 10 req/s, burst 20.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("Invalid global governor configuration"),
    );

    // Stricter for credential endpoints: 2 req/s, burst 5.
    let auth_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(5)
            .finish()
            .expect("Invalid auth governor configuration"),
    );

    let auth_router = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh_token))
        .route_layer(GovernorLayer {
            config: auth_governor_conf,
        });

    let app = Router::new()
        // Health + metrics
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::health_ready))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        // Auth (stricter per-IP limit via sub-router)
        .merge(auth_router)
        .route("/auth/logout", post(handlers::auth::logout))
        // Users
        .route("/users/me", get(handlers::users::get_me))
        .route("/users/me", put(handlers::users::update_me))
        // NOTE: /users/search must be registered before /users/:id so the
        // literal segment is not captured by the :id parameter.
        .route("/users/search", get(handlers::users::search_users))
        .route("/users/:id", get(handlers::users::get_user))
        // Contacts
        .route("/contacts", get(handlers::contacts::list_contacts))
        .route(
            "/contacts/request",
            post(handlers::contacts::request_contact),
        )
        .route(
            "/contacts/:id/accept",
            post(handlers::contacts::accept_contact),
        )
        .route(
            "/contacts/:id/reject",
            post(handlers::contacts::reject_contact),
        )
        .route("/contacts/:id", delete(handlers::contacts::remove_contact))
        // Chats
        .route("/chats", get(handlers::chats::list_chats))
        .route("/chats/direct", post(handlers::chats::create_direct_chat))
        .route("/chats/group", post(handlers::chats::create_group_chat))
        .route("/chats/:id", get(handlers::chats::get_chat))
        .route(
            "/chats/:id/participants",
            post(handlers::chats::add_participant),
        )
        .route(
            "/chats/:id/participants/:user_id",
            delete(handlers::chats::remove_participant),
        )
        .route("/chats/:id/leave", post(handlers::chats::leave_chat))
        // Messages
        .route(
            "/chats/:id/messages",
            get(handlers::messages::list_messages),
        )
        .route(
            "/chats/:id/messages",
            post(handlers::messages::create_message),
        )
        // /messages/search before /messages/:id, same reason as /users/search.
        .route(
            "/messages/search",
            get(handlers::messages::search_messages),
        )
        .route(
            "/messages/:id",
            put(handlers::messages::update_message),
        )
        .route(
            "/messages/:id",
            delete(handlers::messages::delete_message),
        )
        .route("/messages/:id/read", post(handlers::messages::mark_read))
        .route(
            "/messages/:id/reactions",
            post(handlers::messages::add_reaction),
        )
        .route(
            "/reactions/:id",
            delete(handlers::messages::remove_reaction),
        )
        // Socket gateway
        .route("/ws", get(socket::websocket_handler))
        // ── Fleet-wide api bucket, then local per-IP throttle ──────────────
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            fleet_rate_limit,
        ))
        .layer(GovernorLayer {
            config: governor_conf,
        })
        // ── Security response headers ──────────────────────────────────────
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        // ── Prometheus + CORS ──────────────────────────────────────────────
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(app_state.clone());

    let addr = config.server_addr();
    info!("🎧 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // `into_make_service_with_connect_info` populates `ConnectInfo<SocketAddr>`
    // for the governor's key extractor, the fleet rate limit, and /metrics.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(app_state))
    .await
    .expect("Server failed to start");
}

/// Wait for SIGINT/SIGTERM, then tell every connected socket the node is
/// going away before the listener stops accepting.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown requested; notifying connected sockets");
    state
        .sockets
        .emit_to_all(
            EV_SERVER_SHUTDOWN,
            json!({
                "message": "Server is shutting down",
                "timestamp": Utc::now(),
            }),
        )
        .await;

    // Give the writer tasks a moment to drain the shutdown frame.
    tokio::time::sleep(Duration::from_millis(500)).await;
}
