// ── Chatvend Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Collecting them in one place eliminates magic numbers and makes the
// billing-sensitive knobs auditable at a glance.

// ── Chat turn pipeline ─────────────────────────────────────────────────────
// The worker builds the model prompt from the most recent stored messages.
pub const CHAT_WINDOW_MESSAGES: usize = 15;

/// Transient LLM failures are retried up to this many times before the job
/// is marked failed.
pub const AI_JOB_MAX_RETRIES: u32 = 3;

/// Worker poll cadence when the queue is empty (~2 Hz).
pub const AI_JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default cap on concurrent in-flight LLM calls (config `ai.concurrent_limit`).
pub const DEFAULT_LLM_CONCURRENT_LIMIT: usize = 16;

// ── Per-user locks ─────────────────────────────────────────────────────────
// Lock keys are `chat:start:{user_id}` / `chat:turn:{user_id}`.
pub const CHAT_START_LOCK_TTL_SECS: u64 = 10;
pub const CHAT_TURN_LOCK_TTL_SECS: u64 = 30;

pub const LOCK_RETRIES: u32 = 5;
pub const LOCK_RETRY_DELAY_MS: u64 = 50;

// ── Cache ──────────────────────────────────────────────────────────────────
/// Read-through decorator TTL.
pub const CACHE_TTL_SECS: u64 = 3_600;

/// Conversation wizard state TTL (15 minutes).
pub const CONV_STATE_TTL_SECS: u64 = 900;

// ── Rate limits (fixed window) ─────────────────────────────────────────────
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const RATE_LIMIT_COMMANDS_PER_MIN: i64 = 20;
pub const RATE_LIMIT_CALLBACKS_PER_MIN: i64 = 30;

// ── Payment reconciliation ─────────────────────────────────────────────────
// Pending payments older than the cutoff are re-verified against the
// gateway; this recovers from lost redirect callbacks.
pub const RECONCILE_INTERVAL_SECS: u64 = 600;
pub const RECONCILE_PENDING_CUTOFF_MINS: i64 = 30;
pub const RECONCILE_BATCH_LIMIT: usize = 50;

// ── Subscription notifications ─────────────────────────────────────────────
/// "Expires in N days" warnings, sent once per (subscription, threshold).
pub const EXPIRY_WARN_THRESHOLD_DAYS: [i64; 2] = [3, 1];

/// Low-credit warning fires when the balance drops below this percent of
/// the plan's full credit grant.
pub const LOW_CREDIT_WARN_PERCENT: i64 = 5;

// ── External call timeouts ─────────────────────────────────────────────────
pub const HTTP_TIMEOUT_SECS: u64 = 15;
pub const GATEWAY_TIMEOUT_SECS: u64 = 30;
pub const LLM_TIMEOUT_SECS: u64 = 30;

/// Telegram long-poll timeout (server side).
pub const TG_POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram hard message limit is 4096 chars; chunk below it.
pub const TG_CHUNK_CHARS: usize = 4_000;

// ── Shutdown ───────────────────────────────────────────────────────────────
/// Workers drain in-flight jobs for up to this long before exiting.
pub const SHUTDOWN_GRACE_SECS: u64 = 20;
