// ── Chatvend Engine: Payment Repository ────────────────────────────────────
// The status column walks initiated → pending → {succeeded, failed,
// cancelled}; every transition is a conditional UPDATE whose row count the
// use-case inspects to detect a lost race. `update_status_if_pending` is
// the write that serializes duplicate gateway callbacks.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{Payment, PaymentStatus};

use super::{opt_ts, parse_opt_ts, parse_ts, ts};

pub fn insert(conn: &Connection, p: &Payment) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO payments (id, user_id, plan_id, provider, amount_irr, currency,
            authority, ref_id, status, created_at, updated_at, paid_at, callback_url,
            description, metadata, subscription_id, activation_code, activation_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            p.id,
            p.user_id,
            p.plan_id,
            p.provider,
            p.amount_irr,
            p.currency,
            p.authority,
            p.ref_id,
            p.status.as_str(),
            ts(p.created_at),
            ts(p.updated_at),
            opt_ts(p.paid_at),
            p.callback_url,
            p.description,
            serde_json::to_string(&p.metadata)?,
            p.subscription_id,
            p.activation_code,
            opt_ts(p.activation_expires_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<Payment>> {
    query_one(conn, &format!("{} WHERE id = ?1", SELECT), params![id])
}

pub fn find_by_authority(
    conn: &Connection,
    provider: &str,
    authority: &str,
) -> EngineResult<Option<Payment>> {
    query_one(
        conn,
        &format!("{} WHERE provider = ?1 AND authority = ?2", SELECT),
        params![provider, authority],
    )
}

/// initiated → pending, stamping the gateway authority.
pub fn mark_pending(
    conn: &Connection,
    id: &str,
    authority: &str,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE payments SET status = 'pending', authority = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'initiated'",
        params![id, authority, ts(now)],
    )?;
    Ok(n == 1)
}

/// pending → `next`. Returns false when another worker already resolved
/// the payment. Succeeded transitions must carry a ref-id; the paid-at
/// stamp is taken from `now`.
pub fn update_status_if_pending(
    conn: &Connection,
    id: &str,
    next: PaymentStatus,
    ref_id: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    debug_assert!(next.is_terminal());
    let paid_at = if next == PaymentStatus::Succeeded { Some(ts(now)) } else { None };
    let n = conn.execute(
        "UPDATE payments SET status = ?2, ref_id = COALESCE(?3, ref_id),
            paid_at = COALESCE(?4, paid_at), updated_at = ?5
         WHERE id = ?1 AND status = 'pending'",
        params![id, next.as_str(), ref_id, paid_at, ts(now)],
    )?;
    Ok(n == 1)
}

/// Link the granted subscription to the payment record.
pub fn set_subscription(conn: &Connection, id: &str, subscription_id: &str) -> EngineResult<()> {
    conn.execute(
        "UPDATE payments SET subscription_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, subscription_id, ts(Utc::now())],
    )?;
    Ok(())
}

/// Attach a manual activation code to an initiated/pending payment.
pub fn set_activation_code(
    conn: &Connection,
    id: &str,
    code: &str,
    expires_at: Option<DateTime<Utc>>,
) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE payments SET activation_code = ?2, activation_expires_at = ?3, updated_at = ?4
         WHERE id = ?1 AND status IN ('initiated', 'pending')",
        params![id, code, opt_ts(expires_at), ts(Utc::now())],
    )?;
    Ok(n == 1)
}

/// Stale pending payments for the reconciler, oldest first.
pub fn list_pending_older_than(
    conn: &Connection,
    cutoff_minutes: i64,
    limit: usize,
) -> EngineResult<Vec<Payment>> {
    let cutoff = Utc::now() - Duration::minutes(cutoff_minutes);
    let mut stmt = conn.prepare(&format!(
        "{} WHERE status = 'pending' AND authority IS NOT NULL AND created_at <= ?1
         ORDER BY created_at ASC LIMIT ?2",
        SELECT
    ))?;
    let mut rows = stmt.query(params![ts(cutoff), limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

pub fn count_succeeded(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM payments WHERE status = 'succeeded'",
        [],
        |r| r.get(0),
    )?)
}

pub fn revenue_irr(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(amount_irr), 0) FROM payments WHERE status = 'succeeded'",
        [],
        |r| r.get(0),
    )?)
}

const SELECT: &str = "SELECT id, user_id, plan_id, provider, amount_irr, currency, authority,
    ref_id, status, created_at, updated_at, paid_at, callback_url, description, metadata,
    subscription_id, activation_code, activation_expires_at FROM payments";

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Option<Payment>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

fn from_row(row: &Row<'_>) -> EngineResult<Payment> {
    let status: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let metadata: String = row.get(14)?;
    Ok(Payment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        provider: row.get(3)?,
        amount_irr: row.get(4)?,
        currency: row.get(5)?,
        authority: row.get(6)?,
        ref_id: row.get(7)?,
        status: status.parse::<PaymentStatus>()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        paid_at: parse_opt_ts(row.get(11)?)?,
        callback_url: row.get(12)?,
        description: row.get(13)?,
        metadata: serde_json::from_str(&metadata)?,
        subscription_id: row.get(15)?,
        activation_code: row.get(16)?,
        activation_expires_at: parse_opt_ts(row.get(17)?)?,
    })
}
