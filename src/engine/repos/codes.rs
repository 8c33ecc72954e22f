// ── Chatvend Engine: Activation Code Repository ────────────────────────────
// Single-use codes. `redeem` filters on is_redeemed = 0 inside the grant
// transaction, so exactly one of two concurrent redeemers changes a row;
// the loser observes false and reports the code as gone.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::ActivationCode;

use super::{opt_ts, parse_opt_ts, parse_ts, ts};

pub fn insert(conn: &Connection, code: &ActivationCode) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO activation_codes (id, code, plan_id, is_redeemed, redeemed_by_user_id,
            redeemed_at, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            code.id,
            code.code,
            code.plan_id,
            code.is_redeemed,
            code.redeemed_by_user_id,
            opt_ts(code.redeemed_at),
            opt_ts(code.expires_at),
            ts(code.created_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_code(conn: &Connection, code: &str) -> EngineResult<Option<ActivationCode>> {
    let mut stmt = conn.prepare(&format!("{} WHERE code = ?1", SELECT))?;
    let mut rows = stmt.query(params![code])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// Consume the code for `user_id`. Returns false when the code is
/// unknown, already redeemed, or expired.
pub fn redeem(
    conn: &Connection,
    code: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE activation_codes SET is_redeemed = 1, redeemed_by_user_id = ?2, redeemed_at = ?3
         WHERE code = ?1 AND is_redeemed = 0
           AND (expires_at IS NULL OR expires_at > ?3)",
        params![code, user_id, ts(now)],
    )?;
    Ok(n == 1)
}

const SELECT: &str = "SELECT id, code, plan_id, is_redeemed, redeemed_by_user_id, redeemed_at,
    expires_at, created_at FROM activation_codes";

fn from_row(row: &Row<'_>) -> EngineResult<ActivationCode> {
    let created_at: String = row.get(7)?;
    Ok(ActivationCode {
        id: row.get(0)?,
        code: row.get(1)?,
        plan_id: row.get(2)?,
        is_redeemed: row.get(3)?,
        redeemed_by_user_id: row.get(4)?,
        redeemed_at: parse_opt_ts(row.get(5)?)?,
        expires_at: parse_opt_ts(row.get(6)?)?,
        created_at: parse_ts(&created_at)?,
    })
}
