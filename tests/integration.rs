// End-to-end scenarios over the real store, cache, locks and services,
// with the three external ports (LLM, gateway, messenger) faked. These
// mirror the flows a production deployment sees: buy → callback → chat →
// charge → expiry → renewal.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatvend::atoms::error::{EngineError, EngineResult};
use chatvend::atoms::types::*;
use chatvend::engine::cache::{KvCache, MemoryCache};
use chatvend::engine::crypto::CryptoService;
use chatvend::engine::gateway::PaymentGateway;
use chatvend::engine::lock::CacheLock;
use chatvend::engine::messenger::Messenger;
use chatvend::engine::metrics::Metrics;
use chatvend::engine::providers::LlmClient;
use chatvend::engine::ratelimit::RateLimiter;
use chatvend::engine::repos::cached::{CachedPlans, CachedPricing, CachedUsers};
use chatvend::engine::repos::{
    jobs, messages, payments, plans as plans_repo, pricing as pricing_repo, purchases, sessions,
    subscriptions, users as users_repo,
};
use chatvend::engine::scheduler::Scheduler;
use chatvend::engine::store::Store;
use chatvend::engine::usecase::chat::ChatService;
use chatvend::engine::usecase::payment::PaymentService;
use chatvend::engine::usecase::subscription::SubscriptionService;
use chatvend::engine::worker::AiJobWorker;

// ── Fake ports ─────────────────────────────────────────────────────────────

struct FakeLlm {
    usage: TokenUsage,
    calls: AtomicUsize,
}

impl FakeLlm {
    fn new() -> Self {
        FakeLlm {
            usage: TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 },
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    fn name(&self) -> &str {
        "fake"
    }
    async fn list_models(&self) -> EngineResult<Vec<String>> {
        Ok(vec!["gpt-4o-mini".into()])
    }
    fn model_info(&self, _m: &str) -> Option<ModelInfo> {
        None
    }
    async fn count_tokens(&self, _m: &str, _msgs: &[PromptMessage]) -> EngineResult<i64> {
        Ok(1)
    }
    async fn chat_with_usage(
        &self,
        _m: &str,
        _msgs: &[PromptMessage],
    ) -> EngineResult<(String, TokenUsage)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(("Hello from the model.".into(), self.usage))
    }
}

struct FakeGateway {
    verifies: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn name(&self) -> &str {
        "zarinpal"
    }
    async fn request_payment(
        &self,
        _amount: i64,
        _description: &str,
        _callback: &str,
        _meta: &Value,
    ) -> EngineResult<(String, String)> {
        Ok(("A-0001".into(), "https://sandbox.zarinpal.com/pg/StartPay/A-0001".into()))
    }
    async fn verify_payment(&self, _authority: &str, _amount: i64) -> EngineResult<String> {
        // Like the real gateway, repeated verifies return the same ref.
        self.verifies.fetch_add(1, Ordering::SeqCst);
        Ok("REF-77".into())
    }
    async fn refund_payment(
        &self,
        _s: &str,
        _a: i64,
        _d: &str,
        _m: RefundMethod,
        _r: &str,
    ) -> EngineResult<RefundReceipt> {
        unimplemented!("refunds are not exercised here")
    }
}

#[derive(Default)]
struct FakeMessenger {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_message(&self, message: OutboundMessage) -> EngineResult<()> {
        self.sent.lock().push(message);
        Ok(())
    }
    async fn set_menu_commands(&self, _c: i64, _a: bool) -> EngineResult<()> {
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<Store>,
    cache: Arc<dyn KvCache>,
    chat: ChatService,
    payments: Arc<PaymentService>,
    subscriptions: Arc<SubscriptionService>,
    scheduler: Scheduler,
    worker: Arc<AiJobWorker>,
    llm: Arc<FakeLlm>,
    gateway: Arc<FakeGateway>,
    messenger: Arc<FakeMessenger>,
}

fn harness() -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
    let ttl = Duration::from_secs(3600);
    let users = Arc::new(CachedUsers::new(store.clone(), cache.clone(), ttl));
    let plans = Arc::new(CachedPlans::new(store.clone(), cache.clone(), ttl));
    let pricing = Arc::new(CachedPricing::new(store.clone(), cache.clone(), ttl));
    let crypto = Arc::new(CryptoService::new(b"0123456789abcdef0123456789abcdef").unwrap());
    let metrics = Arc::new(Metrics::new());

    let llm = Arc::new(FakeLlm::new());
    let gateway = Arc::new(FakeGateway { verifies: AtomicUsize::new(0) });
    let messenger = Arc::new(FakeMessenger::default());

    let subscriptions = Arc::new(SubscriptionService::new(store.clone(), plans.clone()));
    let payments_svc = Arc::new(PaymentService::new(
        store.clone(),
        plans.clone(),
        gateway.clone(),
        messenger.clone(),
        metrics.clone(),
        "https://example.com/pay/callback".into(),
    ));
    let chat = ChatService::new(
        store.clone(),
        plans.clone(),
        pricing.clone(),
        Arc::new(CacheLock::new(cache.clone())),
        crypto.clone(),
    );
    let worker = Arc::new(AiJobWorker::new(
        store.clone(),
        users,
        plans,
        pricing,
        llm.clone(),
        messenger.clone(),
        crypto,
        metrics,
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        subscriptions.clone(),
        payments_svc.clone(),
        messenger.clone(),
        cron::Schedule::from_str("0 0 * * * *").unwrap(),
    );

    Harness {
        store,
        cache,
        chat,
        payments: payments_svc,
        subscriptions,
        scheduler,
        worker,
        llm,
        gateway,
        messenger,
    }
}

impl Harness {
    fn seed_user(&self, tg_id: i64) -> User {
        let mut user = User::new(tg_id, format!("user-{}", tg_id)).unwrap();
        user.registration_status = RegistrationStatus::Completed;
        self.store.with_conn(|c| users_repo::insert(c, &user)).unwrap();
        user
    }

    fn seed_plan(&self, credit_micros: i64) -> SubscriptionPlan {
        let plan = SubscriptionPlan::new("basic", 30, credit_micros, 500_000, vec![]).unwrap();
        self.store.with_conn(|c| plans_repo::insert(c, &plan)).unwrap();
        plan
    }

    fn seed_pricing(&self) {
        self.store
            .with_conn(|c| pricing_repo::upsert(c, &ModelPricing::new("gpt-4o-mini", 10, 20).unwrap()))
            .unwrap();
    }

    fn active_sub(&self, user: &User) -> UserSubscription {
        self.store
            .with_conn(|c| subscriptions::find_active_by_user(c, &user.id))
            .unwrap()
            .unwrap()
    }

    async fn run_one_job(&self) {
        let job = self
            .store
            .with_conn(|c| jobs::claim_next(c, Utc::now()))
            .unwrap()
            .expect("a pending job");
        self.worker.process(job).await;
    }
}

// ── Scenario 1 & 2: metered chat turns ─────────────────────────────────────

#[tokio::test]
async fn happy_chat_turn_debits_exact_usage() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);
    h.seed_pricing();
    h.store
        .with_conn(|c| subscriptions::insert(c, &UserSubscription::new_active(&user.id, &plan, Utc::now())))
        .unwrap();

    let session = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();
    h.chat.send_message(&user, "hello").await.unwrap();
    h.run_one_job().await;

    // prompt 1 × 10 + completion 2 × 20 = 50 micros.
    assert_eq!(h.active_sub(&user).remaining_micros, 9_999_950);
    let window = h.store.with_conn(|c| messages::list_recent(c, &session.id, 10)).unwrap();
    let roles: Vec<ChatRole> = window.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![ChatRole::System, ChatRole::User, ChatRole::Assistant]);
    assert_eq!(h.messenger.sent.lock().len(), 1);
    assert_eq!(
        h.store.with_conn(|c| jobs::count_with_status(c, AiJobStatus::Completed)).unwrap(),
        1
    );
}

#[tokio::test]
async fn insufficient_credits_fail_before_the_call() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);
    h.seed_pricing();
    let mut sub = UserSubscription::new_active(&user.id, &plan, Utc::now());
    sub.remaining_micros = 5;
    h.store.with_conn(|c| subscriptions::insert(c, &sub)).unwrap();

    let session = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();
    h.chat.send_message(&user, "hello").await.unwrap();
    h.run_one_job().await;

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.active_sub(&user).remaining_micros, 5);
    assert_eq!(
        h.store.with_conn(|c| jobs::count_with_status(c, AiJobStatus::Failed)).unwrap(),
        1
    );
    // system + user message only; no assistant row.
    let window = h.store.with_conn(|c| messages::list_recent(c, &session.id, 10)).unwrap();
    assert!(window.iter().all(|m| m.role != ChatRole::Assistant));
}

// ── Scenario 3: duplicate gateway callback ─────────────────────────────────

#[tokio::test]
async fn duplicate_confirm_grants_exactly_once() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);
    let (payment, _url) = h.payments.request_payment(&user, &plan.id).await.unwrap();

    let (a, b) = tokio::join!(h.payments.confirm_auto("A-0001"), h.payments.confirm_auto("A-0001"));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.status, PaymentStatus::Succeeded);
    assert_eq!(b.status, PaymentStatus::Succeeded);
    assert_eq!(a.ref_id.as_deref(), Some("REF-77"));
    assert_eq!(b.ref_id.as_deref(), Some("REF-77"));

    // One subscription, one purchase, regardless of who won.
    let subs = h
        .store
        .with_conn(|c| {
            Ok(c.query_row("SELECT COUNT(*) FROM subscriptions", [], |r| r.get::<_, i64>(0))?)
        })
        .unwrap();
    assert_eq!(subs, 1);
    assert!(h.store.with_conn(|c| purchases::find_by_payment(c, &payment.id)).unwrap().is_some());

    // And an Nth call later stays stable without touching the gateway
    // again.
    let before = h.gateway.verifies.load(Ordering::SeqCst);
    let c = h.payments.confirm_auto("A-0001").await.unwrap();
    assert_eq!(c.status, PaymentStatus::Succeeded);
    assert_eq!(h.gateway.verifies.load(Ordering::SeqCst), before);
}

// ── Scenario 4: reserved purchase activates after expiry ───────────────────

#[tokio::test]
async fn renewal_reserves_then_activates_on_sweep() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);

    // Current subscription, almost over.
    let bought_at = Utc::now() - ChronoDuration::days(30) + ChronoDuration::minutes(1);
    let s1 = UserSubscription::new_active(&user.id, &plan, bought_at);
    let s1_expiry = s1.expires_at.unwrap();
    h.store.with_conn(|c| subscriptions::insert(c, &s1)).unwrap();

    // Renewal while still active: reserved, scheduled at the expiry.
    h.payments.request_payment(&user, &plan.id).await.unwrap();
    let paid = h.payments.confirm_auto("A-0001").await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Succeeded);
    let reserved_rows = h.subscriptions.get_reserved(&user.id).unwrap();
    let reserved = &reserved_rows[0];
    assert_eq!(reserved.scheduled_start_at, Some(s1_expiry));

    // At T+ε the sweep flips both.
    let t_plus = s1_expiry + ChronoDuration::seconds(30);
    h.scheduler.expiry_tick(t_plus).await.unwrap();

    let active = h.active_sub(&user);
    assert_eq!(active.id, reserved.id);
    assert_eq!(active.start_at, Some(t_plus));
    assert_eq!(active.expires_at, Some(t_plus + ChronoDuration::days(30)));
    let old = h.store.with_conn(|c| subscriptions::find_by_id(c, &s1.id)).unwrap().unwrap();
    assert_eq!(old.status, SubscriptionStatus::Finished);
}

// ── Scenario 5: activation code race ───────────────────────────────────────

#[tokio::test]
async fn code_redemption_race_has_one_winner() {
    let h = harness();
    let alice = h.seed_user(42);
    let bob = h.seed_user(43);
    let plan = h.seed_plan(10_000_000);
    let code = h.payments.issue_activation_code(&plan.id, None).await.unwrap();

    let (a, b) = tokio::join!(
        h.payments.redeem_activation_code(&alice, &code.code),
        h.payments.redeem_activation_code(&bob, &code.code)
    );
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one redeemer wins");
    for result in [a, b] {
        if let Err(e) = result {
            assert!(matches!(e, EngineError::NotFound("activation code")));
        }
    }

    let subs: i64 = h
        .store
        .with_conn(|c| {
            Ok(c.query_row("SELECT COUNT(*) FROM subscriptions", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(subs, 1);
}

// ── Scenario 6: storage opt-out ────────────────────────────────────────────

#[tokio::test]
async fn storage_opt_out_has_no_rows_but_replies_and_charges() {
    let h = harness();
    let mut user = h.seed_user(42);
    user.privacy.allow_message_storage = false;
    h.store.with_conn(|c| users_repo::update(c, &user)).unwrap();
    let plan = h.seed_plan(10_000_000);
    h.seed_pricing();
    h.store
        .with_conn(|c| subscriptions::insert(c, &UserSubscription::new_active(&user.id, &plan, Utc::now())))
        .unwrap();

    let session = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();
    let job = h.chat.send_message(&user, "x").await.unwrap();
    assert_eq!(job.payload_text.as_deref(), Some("x"));
    h.run_one_job().await;

    assert_eq!(h.store.with_conn(|c| messages::count_for_session(c, &session.id)).unwrap(), 0);
    assert_eq!(h.messenger.sent.lock().len(), 1);
    assert_eq!(h.active_sub(&user).remaining_micros, 9_999_950);
}

// ── Cross-cutting laws ─────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limiter_honors_the_window_law() {
    let h = harness();
    let rl = RateLimiter::new(h.cache.clone());
    let window = Duration::from_secs(60);
    let mut allowed = 0;
    for _ in 0..30 {
        if rl.allow("rl:42:cmd", 20, window).await {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}

#[tokio::test]
async fn encrypted_transcripts_survive_the_full_loop() {
    let h = harness();
    let mut user = h.seed_user(42);
    user.privacy.data_encrypted = true;
    h.store.with_conn(|c| users_repo::update(c, &user)).unwrap();
    let plan = h.seed_plan(10_000_000);
    h.seed_pricing();
    h.store
        .with_conn(|c| subscriptions::insert(c, &UserSubscription::new_active(&user.id, &plan, Utc::now())))
        .unwrap();

    let session = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();
    h.chat.send_message(&user, "my private question").await.unwrap();
    h.run_one_job().await;

    // Ciphertext at rest.
    let raw = h.store.with_conn(|c| messages::list_recent(c, &session.id, 10)).unwrap();
    assert!(raw.iter().all(|m| m.encrypted));
    assert!(raw.iter().all(|m| !m.content.contains("private")));

    // Plaintext through the transcript API.
    let transcript = h.chat.session_transcript(&user, &session.id, 10).unwrap();
    assert!(transcript.iter().any(|(_, text)| text == "my private question"));
    assert!(transcript.iter().any(|(_, text)| text == "Hello from the model."));
}

#[tokio::test]
async fn ended_sessions_can_resume_and_delete() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);
    h.seed_pricing();
    h.store
        .with_conn(|c| subscriptions::insert(c, &UserSubscription::new_active(&user.id, &plan, Utc::now())))
        .unwrap();

    let first = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();
    h.chat.end_chat(&user).unwrap();
    let second = h.chat.start_chat(&user, "gpt-4o-mini").await.unwrap();

    let back = h.chat.switch_active(&user, &first.id).unwrap();
    assert_eq!(back.id, first.id);

    h.chat.delete_session(&user, &second.id).unwrap();
    let history = h.chat.list_history(&user).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, first.id);
    assert!(h.store.with_conn(|c| sessions::find_by_id(c, &second.id)).unwrap().is_none());
}

#[tokio::test]
async fn reconciler_resolves_stale_pendings() {
    let h = harness();
    let user = h.seed_user(42);
    let plan = h.seed_plan(10_000_000);
    let (payment, _) = h.payments.request_payment(&user, &plan.id).await.unwrap();

    // Age the pending payment past the cutoff, as if the redirect never
    // arrived.
    h.store
        .with_conn(|c| {
            c.execute(
                "UPDATE payments SET created_at = ?1 WHERE id = ?2",
                rusqlite::params![
                    (Utc::now() - ChronoDuration::hours(2)).to_rfc3339(),
                    payment.id
                ],
            )?;
            Ok(())
        })
        .unwrap();

    let resolved = h.payments.reconcile_pending().await.unwrap();
    assert_eq!(resolved, 1);
    let final_payment =
        h.store.with_conn(|c| payments::find_by_id(c, &payment.id)).unwrap().unwrap();
    assert_eq!(final_payment.status, PaymentStatus::Succeeded);
    assert!(h.store.with_conn(|c| purchases::find_by_payment(c, &payment.id)).unwrap().is_some());
}
