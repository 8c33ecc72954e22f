// ── Chatvend Engine: Distributed Lock ──────────────────────────────────────
// Set-if-absent with a random token; unlock is a compare-and-delete so a
// stale token cannot release a key someone else re-acquired after TTL
// expiry. Expiry itself is tolerated: every section guarded by these
// locks is idempotent (job claims are conditional updates, payment
// resolution goes through update_status_if_pending).

use log::warn;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::constants::{LOCK_RETRIES, LOCK_RETRY_DELAY_MS};
use crate::atoms::error::EngineResult;
use crate::engine::cache::KvCache;

pub struct CacheLock {
    cache: Arc<dyn KvCache>,
}

/// Held lock. Not RAII: release is async, so callers call `unlock`
/// explicitly; a dropped guard just waits out its TTL.
pub struct LockGuard {
    pub key: String,
    token: String,
}

impl CacheLock {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        CacheLock { cache }
    }

    fn new_token() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes[..]);
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Try to acquire `key` for `ttl`, retrying a few times at a short
    /// cadence. Returns None when the lock stays contended.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> EngineResult<Option<LockGuard>> {
        let token = Self::new_token();
        for attempt in 0..=LOCK_RETRIES {
            if self.cache.set_nx(key, &token, ttl).await? {
                return Ok(Some(LockGuard { key: key.to_string(), token }));
            }
            if attempt < LOCK_RETRIES {
                tokio::time::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS)).await;
            }
        }
        Ok(None)
    }

    /// Release the guard. Compare-and-delete; releasing someone else's
    /// refreshed lock is impossible. Release failures are logged only,
    /// the TTL is the backstop.
    pub async fn unlock(&self, guard: LockGuard) {
        match self.cache.del_if_eq(&guard.key, &guard.token).await {
            Ok(true) => {}
            Ok(false) => warn!("[lock] {} already expired or taken over", guard.key),
            Err(e) => warn!("[lock] release of {} failed: {}", guard.key, e),
        }
    }
}
