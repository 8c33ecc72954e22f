// ── Chatvend Engine: Conversation State Repository ─────────────────────────
// Ephemeral wizard state for multi-step Telegram flows ("send me the
// activation code", "how many retention days?"). Lives only in the cache
// under `conv:{tg_user_id}` with a 15-minute TTL; losing it just restarts
// the flow.

use std::sync::Arc;
use std::time::Duration;

use crate::atoms::constants::CONV_STATE_TTL_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::ConversationState;
use crate::engine::cache::KvCache;

pub struct ConvStateRepo {
    cache: Arc<dyn KvCache>,
}

impl ConvStateRepo {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        ConvStateRepo { cache }
    }

    fn key(tg_user_id: i64) -> String {
        format!("conv:{}", tg_user_id)
    }

    pub async fn get(&self, tg_user_id: i64) -> EngineResult<Option<ConversationState>> {
        match self.cache.get(&Self::key(tg_user_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, tg_user_id: i64, state: &ConversationState) -> EngineResult<()> {
        let json = serde_json::to_string(state)?;
        self.cache
            .set(&Self::key(tg_user_id), &json, Some(Duration::from_secs(CONV_STATE_TTL_SECS)))
            .await
    }

    pub async fn clear(&self, tg_user_id: i64) -> EngineResult<()> {
        self.cache.del(&Self::key(tg_user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::MemoryCache;

    #[tokio::test]
    async fn set_get_clear_round_trip() {
        let repo = ConvStateRepo::new(Arc::new(MemoryCache::new()));
        assert!(repo.get(42).await.unwrap().is_none());

        let mut state = ConversationState { step: "awaiting_code".into(), ..Default::default() };
        state.data.insert("plan_id".into(), "p1".into());
        repo.set(42, &state).await.unwrap();

        let back = repo.get(42).await.unwrap().unwrap();
        assert_eq!(back.step, "awaiting_code");
        assert_eq!(back.data.get("plan_id").map(String::as_str), Some("p1"));

        repo.clear(42).await.unwrap();
        assert!(repo.get(42).await.unwrap().is_none());
    }
}
