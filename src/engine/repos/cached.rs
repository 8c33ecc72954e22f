// ── Chatvend Engine: Read-Through Cache Decorators ─────────────────────────
// Hot aggregates (users, plans, model pricing) get a cache in front of the
// store. Contract per aggregate:
//   • read: consult the cache, on miss delegate and populate every key
//     that can resolve to the row (user: id + tg id; plan: id + full
//     list; pricing: model name + active list);
//   • write: perform the store write, then invalidate all of those keys;
//   • negative lookups are never cached;
//   • cache failures are logged and swallowed — the store is
//     authoritative.

use log::warn;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{ModelPricing, SubscriptionPlan, User};
use crate::engine::cache::KvCache;
use crate::engine::repos::{plans, pricing, users};
use crate::engine::store::Store;

fn soft<T: Default>(op: &str, res: EngineResult<T>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            warn!("[cache] {} failed (store remains authoritative): {}", op, e);
            T::default()
        }
    }
}

async fn cache_read<T: DeserializeOwned>(cache: &dyn KvCache, key: &str) -> Option<T> {
    match soft("get", cache.get(key).await) {
        Some(json) => serde_json::from_str(&json).ok(),
        None => None,
    }
}

async fn cache_write<T: Serialize>(cache: &dyn KvCache, key: &str, value: &T, ttl: Duration) {
    if let Ok(json) = serde_json::to_string(value) {
        soft("set", cache.set(key, &json, Some(ttl)).await);
    }
}

// ── Users ──────────────────────────────────────────────────────────────────

pub struct CachedUsers {
    store: Arc<Store>,
    cache: Arc<dyn KvCache>,
    ttl: Duration,
}

impl CachedUsers {
    pub fn new(store: Arc<Store>, cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        CachedUsers { store, cache, ttl }
    }

    fn id_key(id: &str) -> String {
        format!("user:id:{}", id)
    }

    fn tg_key(tg_user_id: i64) -> String {
        format!("user:tg:{}", tg_user_id)
    }

    async fn populate(&self, user: &User) {
        cache_write(self.cache.as_ref(), &Self::id_key(&user.id), user, self.ttl).await;
        cache_write(self.cache.as_ref(), &Self::tg_key(user.tg_user_id), user, self.ttl).await;
    }

    async fn invalidate(&self, user: &User) {
        soft("del", self.cache.del(&Self::id_key(&user.id)).await);
        soft("del", self.cache.del(&Self::tg_key(user.tg_user_id)).await);
    }

    pub async fn find_by_id(&self, id: &str) -> EngineResult<Option<User>> {
        if let Some(user) = cache_read::<User>(self.cache.as_ref(), &Self::id_key(id)).await {
            return Ok(Some(user));
        }
        let user = self.store.with_conn(|conn| users::find_by_id(conn, id))?;
        if let Some(user) = &user {
            self.populate(user).await;
        }
        Ok(user)
    }

    pub async fn find_by_tg_id(&self, tg_user_id: i64) -> EngineResult<Option<User>> {
        if let Some(user) = cache_read::<User>(self.cache.as_ref(), &Self::tg_key(tg_user_id)).await
        {
            return Ok(Some(user));
        }
        let user = self.store.with_conn(|conn| users::find_by_tg_id(conn, tg_user_id))?;
        if let Some(user) = &user {
            self.populate(user).await;
        }
        Ok(user)
    }

    pub async fn insert(&self, user: &User) -> EngineResult<()> {
        self.store.with_conn(|conn| users::insert(conn, user))?;
        self.invalidate(user).await;
        Ok(())
    }

    pub async fn update(&self, user: &User) -> EngineResult<()> {
        self.store.with_conn(|conn| users::update(conn, user))?;
        self.invalidate(user).await;
        Ok(())
    }
}

// ── Plans ──────────────────────────────────────────────────────────────────

pub struct CachedPlans {
    store: Arc<Store>,
    cache: Arc<dyn KvCache>,
    ttl: Duration,
}

const PLAN_LIST_KEY: &str = "plan:all";

impl CachedPlans {
    pub fn new(store: Arc<Store>, cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        CachedPlans { store, cache, ttl }
    }

    fn id_key(id: &str) -> String {
        format!("plan:id:{}", id)
    }

    async fn invalidate(&self, id: &str) {
        soft("del", self.cache.del(&Self::id_key(id)).await);
        soft("del", self.cache.del(PLAN_LIST_KEY).await);
    }

    pub async fn find_by_id(&self, id: &str) -> EngineResult<Option<SubscriptionPlan>> {
        if let Some(plan) =
            cache_read::<SubscriptionPlan>(self.cache.as_ref(), &Self::id_key(id)).await
        {
            return Ok(Some(plan));
        }
        let plan = self.store.with_conn(|conn| plans::find_by_id(conn, id))?;
        if let Some(plan) = &plan {
            cache_write(self.cache.as_ref(), &Self::id_key(id), plan, self.ttl).await;
        }
        Ok(plan)
    }

    pub async fn list_all(&self) -> EngineResult<Vec<SubscriptionPlan>> {
        if let Some(list) =
            cache_read::<Vec<SubscriptionPlan>>(self.cache.as_ref(), PLAN_LIST_KEY).await
        {
            return Ok(list);
        }
        let list = self.store.with_conn(plans::list_all)?;
        if !list.is_empty() {
            cache_write(self.cache.as_ref(), PLAN_LIST_KEY, &list, self.ttl).await;
        }
        Ok(list)
    }

    pub async fn insert(&self, plan: &SubscriptionPlan) -> EngineResult<()> {
        self.store.with_conn(|conn| plans::insert(conn, plan))?;
        self.invalidate(&plan.id).await;
        Ok(())
    }

    pub async fn update(&self, plan: &SubscriptionPlan) -> EngineResult<()> {
        self.store.with_conn(|conn| plans::update(conn, plan))?;
        self.invalidate(&plan.id).await;
        Ok(())
    }

    /// Raw delete + invalidation. The reference guard lives in the
    /// subscription use-case, which runs it inside the same transaction.
    pub async fn delete(&self, id: &str) -> EngineResult<bool> {
        let deleted = self.store.with_conn(|conn| plans::delete(conn, id))?;
        self.invalidate(id).await;
        Ok(deleted)
    }
}

// ── Model pricing ──────────────────────────────────────────────────────────

pub struct CachedPricing {
    store: Arc<Store>,
    cache: Arc<dyn KvCache>,
    ttl: Duration,
}

const PRICING_ACTIVE_KEY: &str = "price:active";

impl CachedPricing {
    pub fn new(store: Arc<Store>, cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        CachedPricing { store, cache, ttl }
    }

    fn model_key(model: &str) -> String {
        format!("price:model:{}", model)
    }

    async fn invalidate(&self, model: &str) {
        soft("del", self.cache.del(&Self::model_key(model)).await);
        soft("del", self.cache.del(PRICING_ACTIVE_KEY).await);
    }

    pub async fn find_active_by_model(&self, model: &str) -> EngineResult<Option<ModelPricing>> {
        if let Some(p) =
            cache_read::<ModelPricing>(self.cache.as_ref(), &Self::model_key(model)).await
        {
            return Ok(Some(p));
        }
        let p = self.store.with_conn(|conn| pricing::find_active_by_model(conn, model))?;
        if let Some(p) = &p {
            cache_write(self.cache.as_ref(), &Self::model_key(model), p, self.ttl).await;
        }
        Ok(p)
    }

    pub async fn list_active(&self) -> EngineResult<Vec<ModelPricing>> {
        if let Some(list) =
            cache_read::<Vec<ModelPricing>>(self.cache.as_ref(), PRICING_ACTIVE_KEY).await
        {
            return Ok(list);
        }
        let list = self.store.with_conn(pricing::list_active)?;
        if !list.is_empty() {
            cache_write(self.cache.as_ref(), PRICING_ACTIVE_KEY, &list, self.ttl).await;
        }
        Ok(list)
    }

    pub async fn upsert(&self, p: &ModelPricing) -> EngineResult<()> {
        self.store.with_tx(|tx| pricing::upsert(tx, p))?;
        self.invalidate(&p.model_name).await;
        Ok(())
    }

    pub async fn deactivate(&self, model: &str) -> EngineResult<bool> {
        let changed = self.store.with_conn(|conn| pricing::deactivate(conn, model))?;
        self.invalidate(model).await;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::MemoryCache;
    use rusqlite::params;

    fn fixture() -> (Arc<Store>, Arc<dyn KvCache>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        (store, cache)
    }

    #[tokio::test]
    async fn user_read_populates_both_keys() {
        let (store, cache) = fixture();
        let repo = CachedUsers::new(store.clone(), cache.clone(), Duration::from_secs(60));
        let user = User::new(42, "Ada").unwrap();
        repo.insert(&user).await.unwrap();

        // First read goes to the store and populates both keys; a lookup
        // by the other key must now hit the cache.
        repo.find_by_id(&user.id).await.unwrap().unwrap();
        assert!(cache.get(&format!("user:tg:{}", 42)).await.unwrap().is_some());
        assert!(cache.get(&format!("user:id:{}", user.id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn user_write_invalidates_stale_reads() {
        let (store, cache) = fixture();
        let repo = CachedUsers::new(store.clone(), cache.clone(), Duration::from_secs(60));
        let mut user = User::new(42, "Ada").unwrap();
        repo.insert(&user).await.unwrap();
        repo.find_by_id(&user.id).await.unwrap();

        // Mutate behind the decorator: the cached copy is now stale.
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE users SET display_name = 'Grace' WHERE id = ?1",
                    params![user.id],
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(repo.find_by_id(&user.id).await.unwrap().unwrap().display_name, "Ada");

        // A decorator write invalidates, the next read sees the store.
        user.display_name = "Grace".into();
        repo.update(&user).await.unwrap();
        assert_eq!(repo.find_by_id(&user.id).await.unwrap().unwrap().display_name, "Grace");
    }

    #[tokio::test]
    async fn missing_rows_are_not_cached() {
        let (store, cache) = fixture();
        let repo = CachedUsers::new(store, cache.clone(), Duration::from_secs(60));
        assert!(repo.find_by_tg_id(7).await.unwrap().is_none());
        assert!(cache.get("user:tg:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_list_is_invalidated_on_insert() {
        let (store, cache) = fixture();
        let repo = CachedPlans::new(store, cache, Duration::from_secs(60));
        let a = SubscriptionPlan::new("basic", 30, 1, 100, vec![]).unwrap();
        repo.insert(&a).await.unwrap();
        assert_eq!(repo.list_all().await.unwrap().len(), 1);

        let b = SubscriptionPlan::new("pro", 30, 1, 900, vec![]).unwrap();
        repo.insert(&b).await.unwrap();
        // The cached list from before the insert must not survive.
        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pricing_upsert_refreshes_model_key() {
        let (store, cache) = fixture();
        let repo = CachedPricing::new(store, cache, Duration::from_secs(60));
        let v1 = ModelPricing::new("gpt-4o-mini", 10, 20).unwrap();
        repo.upsert(&v1).await.unwrap();
        assert_eq!(
            repo.find_active_by_model("gpt-4o-mini").await.unwrap().unwrap().input_micros_per_token,
            10
        );

        let v2 = ModelPricing::new("gpt-4o-mini", 12, 24).unwrap();
        repo.upsert(&v2).await.unwrap();
        assert_eq!(
            repo.find_active_by_model("gpt-4o-mini").await.unwrap().unwrap().input_micros_per_token,
            12
        );
    }
}
