use std::sync::Arc;

use crate::config::Config;
use crate::db::Db;
use crate::kv::Kv;
use crate::messages::MessageCoordinator;
use crate::presence::PresenceRegistry;
use crate::pubsub::PubSubBridge;
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::session::SessionStore;
use crate::socket::SocketManager;
use crate::typing::TypingTracker;

/// Shared application state passed to all handlers and extractors.
///
/// Every component wraps its shared internals in an `Arc`, so cloning
/// `AppState` per request is inexpensive. Construction order (in `main`)
/// mirrors the dependency graph; teardown is the reverse.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub kv: Kv,
    pub sessions: SessionStore,
    pub presence: PresenceRegistry,
    pub typing: TypingTracker,
    pub limiter: RateLimiter,
    pub bus: PubSubBridge,
    pub coordinator: MessageCoordinator,
    pub sockets: SocketManager,
    pub scheduler: Scheduler,
    /// Shared HTTP client, used by the readiness probe against the object
    /// store.
    pub http_client: reqwest::Client,
}
