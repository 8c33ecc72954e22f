// ── Chatvend Engine: Plan Repository ───────────────────────────────────────
// `supported_models` is a JSON array column; empty array means every model.

use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::SubscriptionPlan;

use super::{parse_ts, ts};

pub fn insert(conn: &Connection, plan: &SubscriptionPlan) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO plans (id, name, duration_days, credit_micros, price_irr,
            supported_models, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            plan.id,
            plan.name,
            plan.duration_days,
            plan.credit_micros,
            plan.price_irr,
            serde_json::to_string(&plan.supported_models)?,
            ts(plan.created_at),
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, plan: &SubscriptionPlan) -> EngineResult<()> {
    conn.execute(
        "UPDATE plans SET name = ?2, duration_days = ?3, credit_micros = ?4,
            price_irr = ?5, supported_models = ?6
         WHERE id = ?1",
        params![
            plan.id,
            plan.name,
            plan.duration_days,
            plan.credit_micros,
            plan.price_irr,
            serde_json::to_string(&plan.supported_models)?,
        ],
    )?;
    Ok(())
}

/// Returns false when no row matched. The delete guard (no active or
/// reserved references) is enforced by the subscription use-case.
pub fn delete(conn: &Connection, id: &str) -> EngineResult<bool> {
    let n = conn.execute("DELETE FROM plans WHERE id = ?1", params![id])?;
    Ok(n == 1)
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<SubscriptionPlan>> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_all(conn: &Connection) -> EngineResult<Vec<SubscriptionPlan>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY price_irr ASC", SELECT))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

const SELECT: &str = "SELECT id, name, duration_days, credit_micros, price_irr,
    supported_models, created_at FROM plans";

fn from_row(row: &Row<'_>) -> EngineResult<SubscriptionPlan> {
    let models_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(SubscriptionPlan {
        id: row.get(0)?,
        name: row.get(1)?,
        duration_days: row.get(2)?,
        credit_micros: row.get(3)?,
        price_irr: row.get(4)?,
        supported_models: serde_json::from_str(&models_json)?,
        created_at: parse_ts(&created_at)?,
    })
}
