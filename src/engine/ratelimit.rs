// ── Chatvend Engine: Rate Limiter ──────────────────────────────────────────
// Fixed window per (telegram user, command kind): INCR the window key and
// set its TTL when this call created it. Exceeding the limit returns
// false without blocking. Cache trouble fails open; throttling is never
// worth dropping a paying user's command.

use log::warn;
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::error::EngineResult;
use crate::engine::cache::KvCache;

pub struct RateLimiter {
    cache: Arc<dyn KvCache>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        RateLimiter { cache }
    }

    /// True while the caller stays within `limit` calls per `window`.
    pub async fn allow(&self, key: &str, limit: i64, window: Duration) -> bool {
        match self.check(key, limit, window).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("[ratelimit] cache error for {} (failing open): {}", key, e);
                true
            }
        }
    }

    async fn check(&self, key: &str, limit: i64, window: Duration) -> EngineResult<bool> {
        let count = self.cache.incr(key).await?;
        if count == 1 {
            // First hit opens the window.
            self.cache.expire(key, window).await?;
        }
        Ok(count <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::MemoryCache;

    #[tokio::test]
    async fn allows_up_to_limit_then_blocks() {
        let rl = RateLimiter::new(Arc::new(MemoryCache::new()));
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(rl.allow("rl:42:cmd", 5, window).await);
        }
        assert!(!rl.allow("rl:42:cmd", 5, window).await);
        assert!(!rl.allow("rl:42:cmd", 5, window).await);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let rl = RateLimiter::new(Arc::new(MemoryCache::new()));
        let window = Duration::from_millis(20);
        assert!(rl.allow("rl:42:cmd", 1, window).await);
        assert!(!rl.allow("rl:42:cmd", 1, window).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rl.allow("rl:42:cmd", 1, window).await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rl = RateLimiter::new(Arc::new(MemoryCache::new()));
        let window = Duration::from_secs(60);
        assert!(rl.allow("rl:1:cmd", 1, window).await);
        assert!(!rl.allow("rl:1:cmd", 1, window).await);
        assert!(rl.allow("rl:2:cmd", 1, window).await);
    }
}
