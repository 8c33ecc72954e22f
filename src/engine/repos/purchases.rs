// ── Chatvend Engine: Purchase Repository ───────────────────────────────────
// Append-only receipts; UNIQUE(payment_id) makes "one purchase per
// succeeded payment" a schema fact.

use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::Purchase;

use super::{parse_ts, ts};

pub fn insert(conn: &Connection, p: &Purchase) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO purchases (id, user_id, plan_id, payment_id, subscription_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![p.id, p.user_id, p.plan_id, p.payment_id, p.subscription_id, ts(p.created_at)],
    )?;
    Ok(())
}

pub fn find_by_payment(conn: &Connection, payment_id: &str) -> EngineResult<Option<Purchase>> {
    let mut stmt = conn.prepare(&format!("{} WHERE payment_id = ?1", SELECT))?;
    let mut rows = stmt.query(params![payment_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_by_user(conn: &Connection, user_id: &str) -> EngineResult<Vec<Purchase>> {
    let mut stmt =
        conn.prepare(&format!("{} WHERE user_id = ?1 ORDER BY created_at DESC", SELECT))?;
    let mut rows = stmt.query(params![user_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

const SELECT: &str =
    "SELECT id, user_id, plan_id, payment_id, subscription_id, created_at FROM purchases";

fn from_row(row: &Row<'_>) -> EngineResult<Purchase> {
    let created_at: String = row.get(5)?;
    Ok(Purchase {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        payment_id: row.get(3)?,
        subscription_id: row.get(4)?,
        created_at: parse_ts(&created_at)?,
    })
}
