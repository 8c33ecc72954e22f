// ── Chatvend Engine: Notification Log Repository ───────────────────────────
// Idempotency markers for outbound warnings, one row per
// (subscription, kind, threshold). INSERT OR IGNORE makes the send-once
// decision a single write.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::atoms::error::EngineResult;

use super::ts;

pub const KIND_EXPIRY_WARNING: &str = "expiry_warning";
pub const KIND_LOW_CREDIT: &str = "low_credit";

/// Returns true exactly once per (subscription, kind, threshold); callers
/// send the notification only on true.
pub fn try_mark(
    conn: &Connection,
    subscription_id: &str,
    kind: &str,
    threshold_days: i64,
) -> EngineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO notification_log (subscription_id, kind, threshold_days, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![subscription_id, kind, threshold_days, ts(Utc::now())],
    )?;
    Ok(n == 1)
}
