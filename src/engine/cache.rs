// ── Chatvend Engine: Key-Value Cache ───────────────────────────────────────
// One trait, two backends:
//   • RedisCache  — production; selected when `cache.url` is set. The
//     compare-and-delete runs as a Lua script so a stale unlock token can
//     never delete a refreshed holder's key.
//   • MemoryCache — single-process fallback and test backend; same
//     semantics under one mutex, TTLs expire lazily on access.
//
// The store stays authoritative everywhere a cache is consulted; callers
// log cache errors and move on rather than failing the request.

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::atoms::config::CacheConfig;
use crate::atoms::error::{EngineError, EngineResult};

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()>;
    /// Set-if-absent with TTL. Returns true when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;
    async fn del(&self, key: &str) -> EngineResult<()>;
    /// Delete only when the stored value equals `value`. Returns true when
    /// a key was deleted.
    async fn del_if_eq(&self, key: &str, value: &str) -> EngineResult<bool>;
    /// Atomic increment; missing keys start at 0.
    async fn incr(&self, key: &str) -> EngineResult<i64>;
    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool>;
}

/// Build the configured backend: Redis when a URL is set, in-process map
/// otherwise.
pub async fn connect(cfg: &CacheConfig) -> EngineResult<std::sync::Arc<dyn KvCache>> {
    if cfg.url.trim().is_empty() {
        info!("[cache] No cache.url configured, using in-process cache");
        Ok(std::sync::Arc::new(MemoryCache::new()))
    } else {
        Ok(std::sync::Arc::new(RedisCache::connect(cfg).await?))
    }
}

// ── In-process backend ─────────────────────────────────────────────────────

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    map: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an entry whose TTL has passed; returns whether a live entry
    /// remains. Caller holds the lock.
    fn prune(map: &mut HashMap<String, Entry>, key: &str) -> bool {
        let now = Instant::now();
        match map.get(key) {
            Some(e) if e.is_expired(now) => {
                map.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut map = self.map.lock();
        if !Self::prune(&mut map, key) {
            return Ok(None);
        }
        Ok(map.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()> {
        let mut map = self.map.lock();
        map.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: ttl.map(|d| Instant::now() + d) },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut map = self.map.lock();
        if Self::prune(&mut map, key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> EngineResult<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> EngineResult<bool> {
        let mut map = self.map.lock();
        if !Self::prune(&mut map, key) {
            return Ok(false);
        }
        if map.get(key).map(|e| e.value == value).unwrap_or(false) {
            map.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn incr(&self, key: &str) -> EngineResult<i64> {
        let mut map = self.map.lock();
        Self::prune(&mut map, key);
        let next = match map.get(key) {
            Some(e) => {
                e.value.parse::<i64>().map_err(|_| {
                    EngineError::Cache(format!("INCR on non-integer value at {}", key))
                })? + 1
            }
            None => 1,
        };
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(key.to_string(), Entry { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        let mut map = self.map.lock();
        if !Self::prune(&mut map, key) {
            return Ok(false);
        }
        if let Some(e) = map.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }
}

// ── Redis backend ──────────────────────────────────────────────────────────

pub struct RedisCache {
    mgr: redis::aio::ConnectionManager,
}

// Compare-and-delete: only the holder of the current token may delete.
const DEL_IF_EQ_SCRIPT: &str = r"
    if redis.call('get', KEYS[1]) == ARGV[1] then
        return redis.call('del', KEYS[1])
    else
        return 0
    end";

impl RedisCache {
    pub async fn connect(cfg: &CacheConfig) -> EngineResult<Self> {
        let url = Self::build_url(cfg);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| EngineError::Cache(format!("invalid redis url: {}", e)))?;
        let mgr = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Cache(format!("redis connect failed: {}", e)))?;
        info!("[cache] Connected to redis (db {})", cfg.db);
        Ok(RedisCache { mgr })
    }

    fn build_url(cfg: &CacheConfig) -> String {
        // Inject password/db into a bare host:port URL; URLs that already
        // carry credentials are used as-is.
        if cfg.password.is_empty() && cfg.db == 0 {
            return cfg.url.clone();
        }
        if cfg.url.contains('@') {
            return cfg.url.clone();
        }
        let hostpart = cfg.url.trim_start_matches("redis://");
        format!("redis://:{}@{}/{}", cfg.password, hostpart, cfg.db)
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.mgr.clone()
    }
}

fn cache_err(e: redis::RedisError) -> EngineError {
    EngineError::Cache(e.to_string())
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(cache_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(cache_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.conn();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await.map_err(cache_err)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> EngineResult<bool> {
        let mut conn = self.conn();
        let deleted: i64 = redis::Script::new(DEL_IF_EQ_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(deleted > 0)
    }

    async fn incr(&self, key: &str) -> EngineResult<i64> {
        let mut conn = self.conn();
        redis::cmd("INCR").arg(key).query_async(&mut conn).await.map_err(cache_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<bool> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1) as i64)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(set == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_set_get_del() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_ttl_expires() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_only_first_wins() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn del_if_eq_requires_matching_token() {
        let cache = MemoryCache::new();
        cache.set("lock", "token-a", None).await.unwrap();
        assert!(!cache.del_if_eq("lock", "token-b").await.unwrap());
        assert!(cache.del_if_eq("lock", "token-a").await.unwrap());
        assert!(!cache.del_if_eq("lock", "token-a").await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_from_one() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n").await.unwrap(), 1);
        assert_eq!(cache.incr("n").await.unwrap(), 2);
        assert_eq!(cache.incr("n").await.unwrap(), 3);
    }

    #[test]
    fn redis_url_injects_credentials() {
        let cfg = CacheConfig {
            url: "redis://localhost:6379".into(),
            password: "hunter2".into(),
            db: 3,
            ttl: 60,
        };
        assert_eq!(RedisCache::build_url(&cfg), "redis://:hunter2@localhost:6379/3");
        let plain = CacheConfig { url: "redis://localhost:6379".into(), ..Default::default() };
        assert_eq!(RedisCache::build_url(&plain), "redis://localhost:6379");
    }
}
