// ── Chatvend Atoms: Configuration ──────────────────────────────────────────
// One TOML file, deserialized with serde, validated once at startup.
// Secrets (bot token, API keys, merchant id, encryption key) live here and
// must never be logged; log the section names only.

use serde::Deserialize;

use crate::atoms::constants::DEFAULT_LLM_CONCURRENT_LIMIT;
use crate::atoms::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub ai: AiConfig,
    pub payment: PaymentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub security: SecurityConfig,
}

// ── bot ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub token: String,
    #[serde(default)]
    pub mode: BotMode,
    #[serde(default = "default_bot_port")]
    pub port: u16,
    /// Size of the inbound update worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Telegram user ids with access to the admin commands.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    #[default]
    Polling,
    Webhook,
}

fn default_bot_port() -> u16 {
    8443
}

fn default_workers() -> usize {
    8
}

// ── log ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub sampling: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Console,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: default_log_level(), format: LogFormat::Console, sampling: false }
    }
}

// ── database / cache ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Redis URL (`redis://…`). Empty selects the in-process cache.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    /// Default TTL for decorator entries, seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
}

fn default_cache_ttl() -> u64 {
    crate::atoms::constants::CACHE_TTL_SECS
}

// ── ai ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub openai_key: Option<String>,
    #[serde(default)]
    pub gemini_key: Option<String>,
    #[serde(default)]
    pub metis_key: Option<String>,
    #[serde(default)]
    pub metis_base_url: Option<String>,
    pub default_model: String,
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,
}

fn default_concurrent_limit() -> usize {
    DEFAULT_LLM_CONCURRENT_LIMIT
}

// ── payment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub zarinpal: ZarinpalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZarinpalConfig {
    pub merchant_id: String,
    /// Public URL the gateway redirects the payer back to.
    pub callback_url: String,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default)]
    pub sandbox: bool,
    /// Required only for refunds.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_callback_port() -> u16 {
    8090
}

// ── scheduler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Cron expression (with seconds field) for the expiry sweep.
    #[serde(default = "default_expiry_cron")]
    pub expiry_check_cron: String,
}

fn default_expiry_cron() -> String {
    // Top of every hour.
    "0 0 * * * *".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { expiry_check_cron: default_expiry_cron() }
    }
}

// ── security ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// AES key material; byte length selects AES-128/192/256-GCM.
    pub encryption_key: String,
}

// ── Loading & validation ───────────────────────────────────────────────────

impl AppConfig {
    pub fn load(path: &str) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read config file {}: {}", path, e))
        })?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {}", path, e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.bot.token.trim().is_empty() {
            return Err(EngineError::Config("bot.token is required".into()));
        }
        if self.bot.workers == 0 {
            return Err(EngineError::Config("bot.workers must be at least 1".into()));
        }
        if self.database.url.trim().is_empty() {
            return Err(EngineError::Config("database.url is required".into()));
        }
        if self.ai.concurrent_limit == 0 {
            return Err(EngineError::Config("ai.concurrent_limit must be at least 1".into()));
        }
        if self.ai.openai_key.is_none() && self.ai.gemini_key.is_none() && self.ai.metis_key.is_none()
        {
            return Err(EngineError::Config("at least one ai provider key is required".into()));
        }
        if self.payment.zarinpal.merchant_id.trim().is_empty() {
            return Err(EngineError::Config("payment.zarinpal.merchant_id is required".into()));
        }
        if self.payment.zarinpal.callback_url.trim().is_empty() {
            return Err(EngineError::Config("payment.zarinpal.callback_url is required".into()));
        }
        let key_len = self.security.encryption_key.as_bytes().len();
        if !matches!(key_len, 16 | 24 | 32) {
            return Err(EngineError::Config(format!(
                "security.encryption_key must be 16, 24 or 32 bytes, got {}",
                key_len
            )));
        }
        self.scheduler.expiry_check_cron.parse::<cron::Schedule>().map_err(|e| {
            EngineError::Config(format!("scheduler.expiry_check_cron is not valid cron: {}", e))
        })?;
        Ok(())
    }
}
