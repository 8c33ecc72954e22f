// ── Chatvend Engine: Shared State ──────────────────────────────────────────
// One wiring point: open the store, connect the cache, build the ports
// and the services, hand out a single Arc the bridge, worker, scheduler
// and callback server all share.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::config::{AppConfig, BotMode};
use crate::atoms::error::EngineResult;
use crate::engine::cache::{self, KvCache};
use crate::engine::crypto::CryptoService;
use crate::engine::gateway::{PaymentGateway, ZarinpalGateway};
use crate::engine::lock::CacheLock;
use crate::engine::metrics::Metrics;
use crate::engine::providers::{Limited, LlmClient, ProviderRouter};
use crate::engine::ratelimit::RateLimiter;
use crate::engine::repos::cached::{CachedPlans, CachedPricing, CachedUsers};
use crate::engine::repos::convstate::ConvStateRepo;
use crate::engine::store::Store;
use crate::engine::telegram::TelegramBridge;
use crate::engine::usecase::chat::ChatService;
use crate::engine::usecase::payment::PaymentService;
use crate::engine::usecase::privacy::PrivacyService;
use crate::engine::usecase::stats::StatsService;
use crate::engine::usecase::subscription::SubscriptionService;

pub struct EngineState {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub cache: Arc<dyn KvCache>,
    pub metrics: Arc<Metrics>,

    pub users: Arc<CachedUsers>,
    pub plans: Arc<CachedPlans>,
    pub pricing: Arc<CachedPricing>,
    pub convstate: ConvStateRepo,
    pub ratelimit: RateLimiter,
    pub lock: Arc<CacheLock>,
    pub crypto: Arc<CryptoService>,

    pub llm: Arc<dyn LlmClient>,
    pub telegram: Arc<TelegramBridge>,
    pub gateway: Arc<dyn PaymentGateway>,

    pub subscriptions: Arc<SubscriptionService>,
    pub payments: Arc<PaymentService>,
    pub chat: Arc<ChatService>,
    pub privacy: Arc<PrivacyService>,
    pub stats: Arc<StatsService>,
}

impl EngineState {
    pub async fn init(config: AppConfig) -> EngineResult<Arc<Self>> {
        if config.bot.mode == BotMode::Webhook {
            warn!("[state] bot.mode = webhook is not served by this build; using long-polling");
        }

        let store = Arc::new(Store::open(&config.database.url)?);
        let cache = cache::connect(&config.cache).await?;
        let metrics = Arc::new(Metrics::new());
        let ttl = Duration::from_secs(config.cache.ttl);

        let users = Arc::new(CachedUsers::new(store.clone(), cache.clone(), ttl));
        let plans = Arc::new(CachedPlans::new(store.clone(), cache.clone(), ttl));
        let pricing = Arc::new(CachedPricing::new(store.clone(), cache.clone(), ttl));
        let convstate = ConvStateRepo::new(cache.clone());
        let ratelimit = RateLimiter::new(cache.clone());
        let lock = Arc::new(CacheLock::new(cache.clone()));
        let crypto = Arc::new(CryptoService::new(config.security.encryption_key.as_bytes())?);

        let router = Arc::new(ProviderRouter::from_config(&config.ai)?);
        let llm: Arc<dyn LlmClient> =
            Arc::new(Limited::new(router, config.ai.concurrent_limit));
        let telegram = Arc::new(TelegramBridge::new(&config.bot.token));
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(ZarinpalGateway::new(&config.payment.zarinpal));

        let subscriptions = Arc::new(SubscriptionService::new(store.clone(), plans.clone()));
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            plans.clone(),
            gateway.clone(),
            telegram.clone(),
            metrics.clone(),
            config.payment.zarinpal.callback_url.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            store.clone(),
            plans.clone(),
            pricing.clone(),
            lock.clone(),
            crypto.clone(),
        ));
        let privacy = Arc::new(PrivacyService::new(users.clone()));
        let stats = Arc::new(StatsService::new(store.clone()));

        info!("[state] Engine wired: {} update workers, llm cap {}", config.bot.workers, config.ai.concurrent_limit);
        Ok(Arc::new(EngineState {
            config,
            store,
            cache,
            metrics,
            users,
            plans,
            pricing,
            convstate,
            ratelimit,
            lock,
            crypto,
            llm,
            telegram,
            gateway,
            subscriptions,
            payments,
            chat,
            privacy,
            stats,
        }))
    }
}
