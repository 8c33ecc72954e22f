// ── Chatvend Engine: HTTP Retry Helpers ────────────────────────────────────
// Shared by the LLM provider clients, the payment gateway client, and the
// Telegram bridge reconnect path.
//
//   • Exponential backoff with ±25% jitter (base 1s, cap 30s)
//   • Retry on 429 / 5xx / 529
//   • Respects Retry-After when the server sent one
//   • Bridge reconnects escalate to a 5-minute cap

use rand::Rng;
use std::time::Duration;

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;
const MAX_RECONNECT_DELAY_MS: u64 = 300_000;

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

fn apply_jitter(delay_ms: u64) -> u64 {
    let jitter = delay_ms / 4;
    if jitter == 0 {
        return delay_ms;
    }
    let low = delay_ms - jitter;
    let high = delay_ms + jitter;
    rand::thread_rng().gen_range(low..=high)
}

/// Sleep with exponential backoff + jitter, honoring a server-sent
/// Retry-After (capped at 60s, floored at the computed backoff). Returns
/// the actual delay for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = match retry_after_secs {
        Some(secs) => (secs.min(60) * 1_000).max(capped_ms),
        None => capped_ms,
    };
    let delay = Duration::from_millis(apply_jitter(delay_ms));
    tokio::time::sleep(delay).await;
    delay
}

/// Escalating delay for bridge reconnects, capped at 5 minutes.
pub async fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    let delay = Duration::from_millis(apply_jitter(base_ms.min(MAX_RECONNECT_DELAY_MS)));
    tokio::time::sleep(delay).await;
    delay
}
