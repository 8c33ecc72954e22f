// ── Chatvend Engine: AI Job Worker ─────────────────────────────────────────
// Fixed pool draining the durable turn queue. One claim runs:
//   claim → gather → pre-check → LLM call → charge & record → deliver.
// Money rules: the pre-check blocks hopeless calls using the prompt cost
// alone; the real debit uses the provider-reported usage and shares a
// transaction with the assistant-message append, so a failed debit leaves
// neither a charge nor a message. Delivery failures never reverse the
// charge; the reply is still in history.

use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::atoms::constants::{
    AI_JOB_MAX_RETRIES, AI_JOB_POLL_INTERVAL_MS, CHAT_WINDOW_MESSAGES, LOW_CREDIT_WARN_PERCENT,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    AiJob, ChatMessage, ChatRole, ChatSession, ModelPricing, OutboundMessage, PromptMessage,
    TokenUsage, User, UserSubscription,
};
use crate::engine::crypto::CryptoService;
use crate::engine::messenger::Messenger;
use crate::engine::metrics::Metrics;
use crate::engine::providers::{estimate_tokens, LlmClient};
use crate::engine::repos::cached::{CachedPlans, CachedPricing, CachedUsers};
use crate::engine::repos::{jobs, messages, notifications, sessions, subscriptions};
use crate::engine::store::Store;
use crate::engine::usecase::chat::SYSTEM_PROMPT;

pub struct AiJobWorker {
    store: Arc<Store>,
    users: Arc<CachedUsers>,
    plans: Arc<CachedPlans>,
    pricing: Arc<CachedPricing>,
    llm: Arc<dyn LlmClient>,
    messenger: Arc<dyn Messenger>,
    crypto: Arc<CryptoService>,
    metrics: Arc<Metrics>,
}

struct TurnContext {
    session: ChatSession,
    user: User,
    pricing: ModelPricing,
    subscription: UserSubscription,
    window: Vec<PromptMessage>,
}

impl AiJobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        users: Arc<CachedUsers>,
        plans: Arc<CachedPlans>,
        pricing: Arc<CachedPricing>,
        llm: Arc<dyn LlmClient>,
        messenger: Arc<dyn Messenger>,
        crypto: Arc<CryptoService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        AiJobWorker { store, users, plans, pricing, llm, messenger, crypto, metrics }
    }

    /// Spawn `count` polling loops. They exit on the stop flag after
    /// finishing their in-flight job.
    pub fn spawn_pool(
        self: &Arc<Self>,
        count: usize,
        stop: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|i| {
                let worker = self.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    info!("[worker] AI worker {} up", i);
                    worker.run_loop(stop).await;
                    info!("[worker] AI worker {} drained", i);
                })
            })
            .collect()
    }

    async fn run_loop(&self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            let claimed = self.store.with_conn(|conn| jobs::claim_next(conn, Utc::now()));
            match claimed {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(AI_JOB_POLL_INTERVAL_MS)).await;
                }
                Err(e) => {
                    error!("[worker] Claim failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(AI_JOB_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    pub async fn process(&self, job: AiJob) {
        let ctx = match self.gather(&job).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fail_terminal(&job, &e, None).await;
                return;
            }
        };

        // Pre-check: prompt cost at the input rate against the balance.
        let prompt_tokens = match self.llm.count_tokens(&ctx.session.model, &ctx.window).await {
            Ok(n) => n,
            Err(_) => estimate_tokens(&ctx.window),
        };
        let required = ctx.pricing.prompt_cost_micros(prompt_tokens);
        if ctx.subscription.remaining_micros < required {
            let e = EngineError::InsufficientBalance {
                required,
                remaining: ctx.subscription.remaining_micros,
            };
            self.fail_terminal(&job, &e, Some(&ctx.user)).await;
            return;
        }

        // The call itself.
        let (reply, usage) = match self.llm.chat_with_usage(&ctx.session.model, &ctx.window).await
        {
            Ok(out) => out,
            Err(e) if e.is_transient() && job.retries < AI_JOB_MAX_RETRIES => {
                warn!(
                    "[worker] Job {} transient failure (retry {}): {}",
                    job.id,
                    job.retries + 1,
                    e
                );
                if let Err(e2) = self
                    .store
                    .with_conn(|c| jobs::retry(c, &job.id, &e.to_string(), Utc::now()))
                {
                    error!("[worker] Could not requeue job {}: {}", job.id, e2);
                }
                return;
            }
            Err(e) => {
                self.fail_terminal(&job, &e, Some(&ctx.user)).await;
                return;
            }
        };

        // Charge and record atomically.
        let spent = ctx.pricing.turn_cost_micros(&usage);
        let charged: EngineResult<i64> = self.store.with_tx(|tx| {
            if ctx.user.privacy.allow_message_storage {
                let (content, encrypted) = if ctx.user.privacy.data_encrypted {
                    (self.crypto.encrypt(&reply)?, true)
                } else {
                    (reply.clone(), false)
                };
                messages::insert(
                    tx,
                    &ChatMessage::new(
                        &ctx.session.id,
                        ChatRole::Assistant,
                        content,
                        usage.completion_tokens,
                        encrypted,
                    ),
                )?;
            }
            let remaining = subscriptions::deduct_credits(tx, &ctx.user.id, spent)?;
            if remaining == 0 {
                // Exhausted: the session ends with the balance.
                sessions::finish(tx, &ctx.session.id, Utc::now())?;
            }
            Ok(remaining)
        });

        let remaining = match charged {
            Ok(remaining) => remaining,
            Err(e) => {
                // Rolled back: no charge, no assistant message.
                self.fail_terminal(&job, &e, Some(&ctx.user)).await;
                return;
            }
        };

        self.record_usage(&usage, spent);

        // Deliver after commit; a lost send is logged, never refunded.
        if let Err(e) = self
            .messenger
            .send_message(OutboundMessage::markdown(ctx.user.tg_user_id, &reply))
            .await
        {
            Metrics::incr(&self.metrics.delivery_failures);
            warn!("[worker] Delivery to {} failed: {}", ctx.user.tg_user_id, e);
        }

        match self.store.with_conn(|c| jobs::complete(c, &job.id, Utc::now())) {
            Ok(true) => Metrics::incr(&self.metrics.jobs_completed),
            Ok(false) => warn!("[worker] Job {} was not in processing at completion", job.id),
            Err(e) => error!("[worker] Completing job {} failed: {}", job.id, e),
        }
        info!(
            "[worker] Job {} done: {} prompt + {} completion tokens, {} micros, {} left",
            job.id, usage.prompt_tokens, usage.completion_tokens, spent, remaining
        );

        self.maybe_warn_low_credit(&ctx, remaining).await;
    }

    /// Load everything a turn needs; any miss is terminal for the job.
    async fn gather(&self, job: &AiJob) -> EngineResult<TurnContext> {
        if job.user_message_id.is_none() && job.payload_text.is_none() {
            return Err(EngineError::JobWithoutMessage(job.id.clone()));
        }

        let session = self
            .store
            .with_conn(|conn| sessions::find_by_id(conn, &job.session_id))?
            .ok_or(EngineError::NotFound("chat session"))?;
        let user = self
            .users
            .find_by_id(&session.user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        let pricing = self
            .pricing
            .find_active_by_model(&session.model)
            .await?
            .ok_or_else(|| EngineError::ModelNotAvailable(session.model.clone()))?;
        let subscription = self
            .store
            .with_conn(|conn| subscriptions::find_active_by_user(conn, &user.id))?
            .ok_or(EngineError::NoActiveSubscription)?;

        let stored = self
            .store
            .with_conn(|conn| messages::list_recent(conn, &session.id, CHAT_WINDOW_MESSAGES))?;
        let mut window = Vec::with_capacity(stored.len() + 2);
        for msg in &stored {
            let text = if msg.encrypted {
                self.crypto.decrypt(&msg.content)?
            } else {
                msg.content.clone()
            };
            window.push(PromptMessage::new(msg.role, text));
        }
        if !window.iter().any(|m| matches!(m.role, ChatRole::System)) {
            window.insert(0, PromptMessage::new(ChatRole::System, SYSTEM_PROMPT));
        }
        if let Some(text) = &job.payload_text {
            window.push(PromptMessage::new(ChatRole::User, text.clone()));
        }

        Ok(TurnContext { session, user, pricing, subscription, window })
    }

    async fn fail_terminal(&self, job: &AiJob, e: &EngineError, user: Option<&User>) {
        warn!("[worker] Job {} failed: {}", job.id, e);
        if let Err(e2) = self.store.with_conn(|c| jobs::fail(c, &job.id, &e.to_string(), Utc::now()))
        {
            error!("[worker] Could not mark job {} failed: {}", job.id, e2);
        }
        Metrics::incr(&self.metrics.jobs_failed);

        if let Some(user) = user {
            let text = match e {
                EngineError::InsufficientBalance { .. } => {
                    "⚠️ Not enough credits for this turn. Use /plans to top up.".to_string()
                }
                EngineError::NoActiveSubscription | EngineError::ExpiredSubscription => {
                    "⚠️ Your subscription has ended. Use /plans to continue chatting.".to_string()
                }
                EngineError::ModelNotAvailable(m) => {
                    format!("⚠️ Model {} is no longer available. Start a new chat with /chat.", m)
                }
                _ => "⚠️ Something went wrong while answering. Please try again.".to_string(),
            };
            let _ = self
                .messenger
                .send_message(OutboundMessage::text(user.tg_user_id, text))
                .await;
        }
    }

    fn record_usage(&self, usage: &TokenUsage, spent: i64) {
        Metrics::add(&self.metrics.prompt_tokens, usage.prompt_tokens.max(0) as u64);
        Metrics::add(&self.metrics.completion_tokens, usage.completion_tokens.max(0) as u64);
        Metrics::add(&self.metrics.credits_spent_micros, spent.max(0) as u64);
    }

    /// One-time warning when the balance drops under the plan threshold.
    async fn maybe_warn_low_credit(&self, ctx: &TurnContext, remaining: i64) {
        let plan = match self.plans.find_by_id(&ctx.subscription.plan_id).await {
            Ok(Some(plan)) => plan,
            _ => return,
        };
        let threshold = plan.credit_micros * LOW_CREDIT_WARN_PERCENT / 100;
        if remaining >= threshold || remaining == 0 {
            return;
        }
        let fresh = self.store.with_conn(|c| {
            notifications::try_mark(c, &ctx.subscription.id, notifications::KIND_LOW_CREDIT, 0)
        });
        if let Ok(true) = fresh {
            let _ = self
                .messenger
                .send_message(OutboundMessage::text(
                    ctx.user.tg_user_id,
                    format!(
                        "💳 Heads up: under {}% of your plan credits remain.",
                        LOW_CREDIT_WARN_PERCENT
                    ),
                ))
                .await;
        }
    }
}
