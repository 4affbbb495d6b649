//! Fixed-window rate limiting on the shared ephemeral store.
//!
//! Each `(scope, community, platform, user)` gets one counter whose first
//! increment sets the expiry to the window length. This can let up to twice
//! the limit through across a window boundary, unlike a sliding log, but it
//! costs O(1) memory per user and one round trip per check.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::ephemeral::EphemeralStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Message,
    Command,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Message => "message",
            RateLimitScope::Command => "command",
        }
    }

    pub fn key(&self, community_id: &str, platform: &str, user_id: &str) -> String {
        format!("ratelimit:{}:{}:{}:{}", self.as_str(), community_id, platform, user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub retry_after: Duration,
    /// This request is the one that crossed the limit in its window.
    pub first_denial: bool,
    /// The store could not be reached and the request was let through.
    pub degraded: bool,
}

impl RateLimitResult {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            first_denial: false,
            degraded: false,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self { store }
    }

    /// Count one request against the window and decide whether it may pass.
    ///
    /// A `limit` of zero disables the scope. Fails open when the store is
    /// unreachable.
    pub async fn allow(
        &self,
        community_id: &str,
        platform: &str,
        user_id: &str,
        scope: RateLimitScope,
        limit: u32,
        window_seconds: u64,
    ) -> RateLimitResult {
        if limit == 0 {
            return RateLimitResult::allowed();
        }

        let key = scope.key(community_id, platform, user_id);
        match self.store.incr_window(&key, window_seconds.max(1)).await {
            Ok(window) if window.count > i64::from(limit) => RateLimitResult {
                allowed: false,
                retry_after: Duration::from_secs(window.ttl_secs.max(1) as u64),
                first_denial: window.count == i64::from(limit) + 1,
                degraded: false,
            },
            Ok(_) => RateLimitResult::allowed(),
            Err(e) => {
                warn!(
                    degraded = true,
                    scope = scope.as_str(),
                    community_id,
                    error = %e,
                    "rate limiter store unavailable; failing open"
                );
                metrics::counter!("gatekeeper_degraded_total", 1, "component" => "rate_limiter");
                RateLimitResult {
                    degraded: true,
                    ..RateLimitResult::allowed()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::{DownStore, MemoryStore};

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            RateLimitScope::Command.key("c1", "twitch", "u1"),
            "ratelimit:command:c1:twitch:u1"
        );
    }

    #[tokio::test]
    async fn test_denies_after_limit() {
        let limiter = limiter();
        for i in 0..3 {
            let result = limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 3, 60).await;
            assert!(result.allowed, "request {} should pass", i + 1);
        }
        let result = limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 3, 60).await;
        assert!(!result.allowed);
        assert!(result.first_denial);
        assert!(result.retry_after > Duration::ZERO);
        assert!(result.retry_after <= Duration::from_secs(60));

        let again = limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 3, 60).await;
        assert!(!again.allowed);
        assert!(!again.first_denial);
    }

    #[tokio::test]
    async fn test_scopes_and_users_are_independent() {
        let limiter = limiter();
        assert!(limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await.allowed);
        assert!(!limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await.allowed);

        assert!(limiter.allow("c1", "twitch", "u1", RateLimitScope::Command, 1, 60).await.allowed);
        assert!(limiter.allow("c1", "twitch", "u2", RateLimitScope::Message, 1, 60).await.allowed);
        assert!(limiter.allow("c1", "discord", "u1", RateLimitScope::Message, 1, 60).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter();
        assert!(limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await.allowed);
        assert!(!limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await.allowed);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await.allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_disables_scope() {
        let limiter = limiter();
        for _ in 0..10 {
            assert!(limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 0, 60).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let limiter = RateLimiter::new(Arc::new(DownStore));
        let result = limiter.allow("c1", "twitch", "u1", RateLimitScope::Message, 1, 60).await;
        assert!(result.allowed);
        assert!(result.degraded);
    }
}
