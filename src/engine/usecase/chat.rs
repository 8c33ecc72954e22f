// ── Chatvend Engine: Chat Use-Case ─────────────────────────────────────────
// Session lifecycle and the inbound half of a turn. `send_message`
// returns as soon as the user message is durable and the AI job is
// queued; the reply arrives later through the messenger port. Per-user
// locks keep starts and turns serialized.

use chrono::Utc;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::constants::{CHAT_START_LOCK_TTL_SECS, CHAT_TURN_LOCK_TTL_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    AiJob, ChatMessage, ChatRole, ChatSession, PromptMessage, User,
};
use crate::engine::crypto::CryptoService;
use crate::engine::lock::CacheLock;
use crate::engine::providers::estimate_tokens;
use crate::engine::repos::cached::{CachedPlans, CachedPricing};
use crate::engine::repos::{jobs, messages, sessions, subscriptions};
use crate::engine::store::Store;

/// Opening system prompt for every session.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant reached through a Telegram bot. \
Keep answers concise and mobile-friendly; use Markdown sparingly.";

pub struct ChatService {
    store: Arc<Store>,
    plans: Arc<CachedPlans>,
    pricing: Arc<CachedPricing>,
    lock: Arc<CacheLock>,
    crypto: Arc<CryptoService>,
}

impl ChatService {
    pub fn new(
        store: Arc<Store>,
        plans: Arc<CachedPlans>,
        pricing: Arc<CachedPricing>,
        lock: Arc<CacheLock>,
        crypto: Arc<CryptoService>,
    ) -> Self {
        ChatService { store, plans, pricing, lock, crypto }
    }

    /// Start a session on `model`. Requires an unexpired active
    /// subscription whose plan allows the model, and no live session.
    pub async fn start_chat(&self, user: &User, model: &str) -> EngineResult<ChatSession> {
        let key = format!("chat:start:{}", user.id);
        let guard = self
            .lock
            .try_lock(&key, Duration::from_secs(CHAT_START_LOCK_TTL_SECS))
            .await?
            .ok_or_else(|| EngineError::OperationFailed("another start is in progress".into()))?;

        let result = self.start_chat_locked(user, model).await;
        self.lock.unlock(guard).await;
        result
    }

    async fn start_chat_locked(&self, user: &User, model: &str) -> EngineResult<ChatSession> {
        if self
            .store
            .with_conn(|conn| sessions::find_active_by_user(conn, &user.id))?
            .is_some()
        {
            return Err(EngineError::ActiveChatExists);
        }

        let now = Utc::now();
        let sub = self
            .store
            .with_conn(|conn| subscriptions::find_active_by_user(conn, &user.id))?
            .ok_or(EngineError::NoActiveSubscription)?;
        if sub.is_expired(now) {
            return Err(EngineError::ExpiredSubscription);
        }
        let plan =
            self.plans.find_by_id(&sub.plan_id).await?.ok_or(EngineError::NotFound("plan"))?;
        if !plan.supports_model(model)
            || self.pricing.find_active_by_model(model).await?.is_none()
        {
            return Err(EngineError::ModelNotAvailable(model.to_string()));
        }

        let session = ChatSession::new(&user.id, model);
        let system = self.prepare_stored_message(
            user,
            &session.id,
            ChatRole::System,
            SYSTEM_PROMPT.to_string(),
        )?;
        self.store.with_tx(|tx| {
            sessions::insert(tx, &session)?;
            if let Some(msg) = &system {
                messages::insert(tx, msg)?;
            }
            Ok(())
        })?;
        info!("[chat] Session {} started for user {} on {}", session.id, user.id, model);
        Ok(session)
    }

    /// Accept a user turn: persist the message (or carry it on the job
    /// when storage is opted out), enqueue the AI job, return. Message
    /// persistence strictly precedes the enqueue, inside one transaction.
    pub async fn send_message(&self, user: &User, text: &str) -> EngineResult<AiJob> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidArgument("empty message".into()));
        }
        let key = format!("chat:turn:{}", user.id);
        let guard = self
            .lock
            .try_lock(&key, Duration::from_secs(CHAT_TURN_LOCK_TTL_SECS))
            .await?
            .ok_or_else(|| {
                EngineError::OperationFailed("previous turn is still being accepted".into())
            })?;

        let result = self.send_message_locked(user, text);
        self.lock.unlock(guard).await;
        result
    }

    fn send_message_locked(&self, user: &User, text: &str) -> EngineResult<AiJob> {
        let session = self
            .store
            .with_conn(|conn| sessions::find_active_by_user(conn, &user.id))?
            .ok_or(EngineError::NotFound("chat session"))?;

        let now = Utc::now();
        let stored = self.prepare_stored_message(
            user,
            &session.id,
            ChatRole::User,
            text.to_string(),
        )?;
        let job = match &stored {
            Some(msg) => AiJob::new(&session.id, Some(msg.id.clone()), None),
            None => AiJob::new(&session.id, None, Some(text.to_string())),
        };

        self.store.with_tx(|tx| {
            if let Some(msg) = &stored {
                messages::insert(tx, msg)?;
            }
            jobs::enqueue(tx, &job)?;
            sessions::touch(tx, &session.id, now)?;
            Ok(())
        })?;
        Ok(job)
    }

    /// Encrypt-and-wrap a message for storage, or None when the user has
    /// message storage turned off.
    fn prepare_stored_message(
        &self,
        user: &User,
        session_id: &str,
        role: ChatRole,
        text: String,
    ) -> EngineResult<Option<ChatMessage>> {
        if !user.privacy.allow_message_storage {
            return Ok(None);
        }
        let tokens = estimate_tokens(&[PromptMessage::new(role, text.clone())]);
        let (content, encrypted) = if user.privacy.data_encrypted {
            (self.crypto.encrypt(&text)?, true)
        } else {
            (text, false)
        };
        Ok(Some(ChatMessage::new(session_id, role, content, tokens, encrypted)))
    }

    /// Plaintext view of a stored message.
    pub fn decrypt_message(&self, msg: &ChatMessage) -> EngineResult<String> {
        if msg.encrypted {
            self.crypto.decrypt(&msg.content)
        } else {
            Ok(msg.content.clone())
        }
    }

    pub fn end_chat(&self, user: &User) -> EngineResult<ChatSession> {
        let now = Utc::now();
        let session = self
            .store
            .with_conn(|conn| sessions::find_active_by_user(conn, &user.id))?
            .ok_or(EngineError::NotFound("chat session"))?;
        self.store.with_tx(|tx| {
            if !sessions::finish(tx, &session.id, now)? {
                return Err(EngineError::NotFound("chat session"));
            }
            Ok(())
        })?;
        info!("[chat] Session {} ended for user {}", session.id, user.id);
        Ok(session)
    }

    /// Make an older (finished) session the active one, ending the
    /// current session if any. One transaction keeps the one-active
    /// invariant intact throughout.
    pub fn switch_active(&self, user: &User, session_id: &str) -> EngineResult<ChatSession> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let target = sessions::find_by_id(tx, session_id)?
                .filter(|s| s.user_id == user.id)
                .ok_or(EngineError::NotFound("chat session"))?;
            if let Some(current) = sessions::find_active_by_user(tx, &user.id)? {
                if current.id == target.id {
                    return Ok(current);
                }
                sessions::finish(tx, &current.id, now)?;
            }
            if !sessions::reactivate(tx, &target.id, now)? {
                return Err(EngineError::NotFound("chat session"));
            }
            sessions::find_by_id(tx, &target.id)?.ok_or(EngineError::NotFound("chat session"))
        })
    }

    /// Physical delete; history shows only live sessions afterwards.
    pub fn delete_session(&self, user: &User, session_id: &str) -> EngineResult<()> {
        self.store.with_tx(|tx| {
            let target = sessions::find_by_id(tx, session_id)?
                .filter(|s| s.user_id == user.id)
                .ok_or(EngineError::NotFound("chat session"))?;
            sessions::delete(tx, &target.id)?;
            Ok(())
        })
    }

    pub fn list_history(&self, user: &User) -> EngineResult<Vec<ChatSession>> {
        self.store.with_conn(|conn| sessions::list_by_user(conn, &user.id))
    }

    /// Recent messages of one of the user's sessions, decrypted.
    pub fn session_transcript(
        &self,
        user: &User,
        session_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<(ChatRole, String)>> {
        let msgs = self.store.with_conn(|conn| {
            let session = sessions::find_by_id(conn, session_id)?
                .filter(|s| s.user_id == user.id)
                .ok_or(EngineError::NotFound("chat session"))?;
            messages::list_recent(conn, &session.id, limit)
        })?;
        msgs.into_iter()
            .map(|m| Ok((m.role, self.decrypt_message(&m)?)))
            .collect()
    }

    /// Models the user may chat on: active pricing intersected with the
    /// plan's supported set (an empty set allows all).
    pub async fn list_models(&self, user: &User) -> EngineResult<Vec<String>> {
        let sub = self
            .store
            .with_conn(|conn| subscriptions::find_active_by_user(conn, &user.id))?
            .ok_or(EngineError::NoActiveSubscription)?;
        let plan =
            self.plans.find_by_id(&sub.plan_id).await?.ok_or(EngineError::NotFound("plan"))?;
        let priced = self.pricing.list_active().await?;
        Ok(priced
            .into_iter()
            .map(|p| p.model_name)
            .filter(|m| plan.supports_model(m))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AiJobStatus, ModelPricing, SubscriptionPlan, UserSubscription};
    use crate::engine::cache::{KvCache, MemoryCache};
    use crate::engine::repos::{plans as plans_repo, pricing as pricing_repo, users};
    use std::time::Duration as StdDuration;

    struct Fixture {
        store: Arc<Store>,
        svc: ChatService,
        user: User,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let svc = ChatService::new(
            store.clone(),
            Arc::new(CachedPlans::new(store.clone(), cache.clone(), StdDuration::from_secs(60))),
            Arc::new(CachedPricing::new(store.clone(), cache.clone(), StdDuration::from_secs(60))),
            Arc::new(CacheLock::new(cache)),
            Arc::new(CryptoService::new(&[7u8; 32]).unwrap()),
        );

        let user = User::new(42, "Ada").unwrap();
        let plan = SubscriptionPlan::new("basic", 30, 10_000_000, 500_000, vec![]).unwrap();
        let sub = UserSubscription::new_active(&user.id, &plan, Utc::now());
        store
            .with_conn(|conn| {
                users::insert(conn, &user)?;
                plans_repo::insert(conn, &plan)?;
                subscriptions::insert(conn, &sub)?;
                pricing_repo::upsert(conn, &ModelPricing::new("gpt-4o-mini", 10, 20).unwrap())
            })
            .unwrap();
        Fixture { store, svc, user }
    }

    #[tokio::test]
    async fn start_chat_happy_path_appends_system_message() {
        let f = fixture();
        let session = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();
        let window = f
            .store
            .with_conn(|c| messages::list_recent(c, &session.id, 10))
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, ChatRole::System);
        assert_eq!(window[0].content, SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn second_start_is_a_conflict() {
        let f = fixture();
        f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();
        let err = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap_err();
        assert!(matches!(err, EngineError::ActiveChatExists));
    }

    #[tokio::test]
    async fn unpriced_model_is_unavailable() {
        let f = fixture();
        let err = f.svc.start_chat(&f.user, "gpt-5-turbo").await.unwrap_err();
        assert!(matches!(err, EngineError::ModelNotAvailable(_)));
    }

    #[tokio::test]
    async fn send_message_persists_then_enqueues() {
        let f = fixture();
        let session = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();
        let job = f.svc.send_message(&f.user, "hello").await.unwrap();
        assert_eq!(job.status, AiJobStatus::Pending);
        assert!(job.payload_text.is_none());

        let stored_id = job.user_message_id.clone().unwrap();
        let msg = f
            .store
            .with_conn(|c| messages::find_by_id(c, &stored_id))
            .unwrap()
            .unwrap();
        assert_eq!(msg.session_id, session.id);
        assert_eq!(msg.content, "hello");
        assert!(!msg.encrypted);
    }

    #[tokio::test]
    async fn storage_opt_out_carries_text_on_the_job() {
        let f = fixture();
        let mut user = f.user.clone();
        user.privacy.allow_message_storage = false;
        f.store.with_conn(|c| users::update(c, &user)).unwrap();

        let session = f.svc.start_chat(&user, "gpt-4o-mini").await.unwrap();
        let job = f.svc.send_message(&user, "x").await.unwrap();
        assert!(job.user_message_id.is_none());
        assert_eq!(job.payload_text.as_deref(), Some("x"));
        // No rows at all, not even the system prompt.
        assert_eq!(f.store.with_conn(|c| messages::count_for_session(c, &session.id)).unwrap(), 0);
    }

    #[tokio::test]
    async fn encrypted_storage_round_trips() {
        let f = fixture();
        let mut user = f.user.clone();
        user.privacy.data_encrypted = true;
        f.store.with_conn(|c| users::update(c, &user)).unwrap();

        f.svc.start_chat(&user, "gpt-4o-mini").await.unwrap();
        let job = f.svc.send_message(&user, "secret text").await.unwrap();
        let msg = f
            .store
            .with_conn(|c| messages::find_by_id(c, job.user_message_id.as_ref().unwrap()))
            .unwrap()
            .unwrap();
        assert!(msg.encrypted);
        assert_ne!(msg.content, "secret text");
        assert_eq!(f.svc.decrypt_message(&msg).unwrap(), "secret text");
    }

    #[tokio::test]
    async fn switch_active_swaps_sessions_atomically() {
        let f = fixture();
        let first = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();
        f.svc.end_chat(&f.user).unwrap();
        let second = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();

        let back = f.svc.switch_active(&f.user, &first.id).unwrap();
        assert_eq!(back.id, first.id);
        let history = f.svc.list_history(&f.user).unwrap();
        let active: Vec<_> = history
            .iter()
            .filter(|s| s.status == crate::atoms::types::ChatSessionStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first.id);
        assert!(history.iter().any(|s| s.id == second.id));
    }

    #[tokio::test]
    async fn deleted_session_disappears_from_history() {
        let f = fixture();
        let session = f.svc.start_chat(&f.user, "gpt-4o-mini").await.unwrap();
        f.svc.end_chat(&f.user).unwrap();
        f.svc.delete_session(&f.user, &session.id).unwrap();
        assert!(f.svc.list_history(&f.user).unwrap().is_empty());
        let err = f.svc.session_transcript(&f.user, &session.id, 10).unwrap_err();
        assert!(matches!(err, EngineError::NotFound("chat session")));
    }

    #[tokio::test]
    async fn list_models_intersects_plan_and_pricing() {
        let f = fixture();
        f.store
            .with_conn(|c| {
                pricing_repo::upsert(c, &ModelPricing::new("gemini-2.0-flash", 5, 15).unwrap())
            })
            .unwrap();
        // Unrestricted plan sees every priced model.
        let models = f.svc.list_models(&f.user).await.unwrap();
        assert_eq!(models, vec!["gemini-2.0-flash".to_string(), "gpt-4o-mini".to_string()]);
    }
}
