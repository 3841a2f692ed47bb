use std::time::Duration;

use redis::AsyncCommands;

use crate::error::{AppError, AppResult};
use crate::kv::{self, Kv};

// ============================================================================
// Buckets
// ============================================================================

/// A named fixed-window limit. Keys are user IDs, or IPs where no user is
/// known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub name: &'static str,
    pub limit: u32,
    pub window: Duration,
}

pub const API: Bucket = Bucket {
    name: "api",
    limit: 100,
    window: Duration::from_secs(60),
};

/// Cleared on successful login via [`RateLimiter::forget`].
pub const AUTH: Bucket = Bucket {
    name: "auth",
    limit: 5,
    window: Duration::from_secs(15 * 60),
};

pub const MESSAGE: Bucket = Bucket {
    name: "message",
    limit: 10,
    window: Duration::from_secs(1),
};

pub const REACTION: Bucket = Bucket {
    name: "reaction",
    limit: 20,
    window: Duration::from_secs(1),
};

pub const UPLOAD: Bucket = Bucket {
    name: "upload",
    limit: 10,
    window: Duration::from_secs(60),
};

pub const SEARCH: Bucket = Bucket {
    name: "search",
    limit: 30,
    window: Duration::from_secs(60),
};

pub const CONTACT_REQUEST: Bucket = Bucket {
    name: "contact-request",
    limit: 50,
    window: Duration::from_secs(24 * 60 * 60),
};

// ============================================================================
// Decision
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub ok: bool,
    pub retry_after_ms: u64,
}

/// Pure decision function over the incremented counter and the window's
/// remaining lifetime.
fn decide(count: i64, bucket: &Bucket, ttl_ms: i64) -> Decision {
    if count <= i64::from(bucket.limit) {
        Decision {
            ok: true,
            retry_after_ms: 0,
        }
    } else {
        Decision {
            ok: false,
            // A negative TTL means the key expired between commands; the
            // caller may retry immediately after the window rolls.
            retry_after_ms: ttl_ms.max(0) as u64,
        }
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Fleet-wide counters in the KV store, so limits hold no matter which node
/// serves the request. Per-IP HTTP throttling is a separate, purely local
/// `tower_governor` layer.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Kv,
}

impl RateLimiter {
    pub fn new(kv: Kv) -> Self {
        RateLimiter { kv }
    }

    /// Count one hit against `bucket` for `key` and decide.
    pub async fn allow(&self, bucket: &Bucket, key: &str) -> AppResult<Decision> {
        let kv_key = kv::ratelimit_key(bucket.name, key);
        let mut conn = self.kv.conn();

        let count: i64 = conn.incr(&kv_key, 1i64).await?;
        if count == 1 {
            let _: () = conn
                .pexpire(&kv_key, bucket.window.as_millis() as i64)
                .await?;
        }

        let ttl_ms: i64 = if count > i64::from(bucket.limit) {
            conn.pttl(&kv_key).await?
        } else {
            0
        };

        Ok(decide(count, bucket, ttl_ms))
    }

    /// Convert a denial into the uniform error.
    pub async fn check(&self, bucket: &Bucket, key: &str) -> AppResult<()> {
        let decision = self.allow(bucket, key).await?;
        if decision.ok {
            Ok(())
        } else {
            Err(AppError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            })
        }
    }

    /// Drop the counter, e.g. the `auth` bucket after a successful login.
    pub async fn forget(&self, bucket: &Bucket, key: &str) -> AppResult<()> {
        let kv_key = kv::ratelimit_key(bucket.name, key);
        let mut conn = self.kv.conn();
        let _: () = conn.del(&kv_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_the_limit_is_allowed() {
        let d = decide(10, &MESSAGE, 0);
        assert!(d.ok);
        assert_eq!(d.retry_after_ms, 0);
    }

    #[test]
    fn over_the_limit_is_denied_with_retry_after() {
        let d = decide(11, &MESSAGE, 640);
        assert!(!d.ok);
        assert_eq!(d.retry_after_ms, 640);
    }

    #[test]
    fn exactly_the_limit_is_allowed() {
        assert!(decide(i64::from(MESSAGE.limit), &MESSAGE, 0).ok);
        assert!(decide(i64::from(AUTH.limit), &AUTH, 0).ok);
    }

    #[test]
    fn negative_ttl_clamps_to_zero() {
        let d = decide(200, &API, -2);
        assert!(!d.ok);
        assert_eq!(d.retry_after_ms, 0);
    }

    #[test]
    fn bucket_catalogue_matches_policy() {
        assert_eq!(API.limit, 100);
        assert_eq!(API.window, Duration::from_secs(60));
        assert_eq!(AUTH.limit, 5);
        assert_eq!(AUTH.window, Duration::from_secs(900));
        assert_eq!(MESSAGE.limit, 10);
        assert_eq!(MESSAGE.window, Duration::from_secs(1));
        assert_eq!(REACTION.limit, 20);
        assert_eq!(UPLOAD.limit, 10);
        assert_eq!(SEARCH.limit, 30);
        assert_eq!(CONTACT_REQUEST.limit, 50);
        assert_eq!(CONTACT_REQUEST.window, Duration::from_secs(86_400));
    }
}
