// ── Chatvend Engine: Model Pricing Repository ──────────────────────────────
// One active row per model name (partial unique index). Upsert retires the
// previous active row instead of mutating it, keeping a price history.

use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::ModelPricing;

use super::{parse_ts, ts};

/// Deactivate any current active row for the model, then insert the new
/// one. Run inside a transaction.
pub fn upsert(conn: &Connection, pricing: &ModelPricing) -> EngineResult<()> {
    conn.execute(
        "UPDATE model_pricing SET active = 0 WHERE model_name = ?1 AND active = 1",
        params![pricing.model_name],
    )?;
    conn.execute(
        "INSERT INTO model_pricing (id, model_name, input_micros_per_token,
            output_micros_per_token, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            pricing.id,
            pricing.model_name,
            pricing.input_micros_per_token,
            pricing.output_micros_per_token,
            pricing.active,
            ts(pricing.created_at),
        ],
    )?;
    Ok(())
}

pub fn find_active_by_model(conn: &Connection, model: &str) -> EngineResult<Option<ModelPricing>> {
    let mut stmt = conn.prepare(&format!("{} WHERE model_name = ?1 AND active = 1", SELECT))?;
    let mut rows = stmt.query(params![model])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_active(conn: &Connection) -> EngineResult<Vec<ModelPricing>> {
    let mut stmt = conn.prepare(&format!("{} WHERE active = 1 ORDER BY model_name ASC", SELECT))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

/// Returns false when the model had no active row.
pub fn deactivate(conn: &Connection, model: &str) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE model_pricing SET active = 0 WHERE model_name = ?1 AND active = 1",
        params![model],
    )?;
    Ok(n == 1)
}

const SELECT: &str = "SELECT id, model_name, input_micros_per_token, output_micros_per_token,
    active, created_at FROM model_pricing";

fn from_row(row: &Row<'_>) -> EngineResult<ModelPricing> {
    let created_at: String = row.get(5)?;
    Ok(ModelPricing {
        id: row.get(0)?,
        model_name: row.get(1)?,
        input_micros_per_token: row.get(2)?,
        output_micros_per_token: row.get(3)?,
        active: row.get(4)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::Store;

    #[test]
    fn upsert_replaces_the_active_row() {
        let store = Store::open_in_memory().unwrap();
        let v1 = ModelPricing::new("gpt-4o-mini", 10, 20).unwrap();
        let v2 = ModelPricing::new("gpt-4o-mini", 12, 24).unwrap();
        store.with_conn(|c| upsert(c, &v1)).unwrap();
        store.with_conn(|c| upsert(c, &v2)).unwrap();

        let active = store.with_conn(|c| find_active_by_model(c, "gpt-4o-mini")).unwrap().unwrap();
        assert_eq!(active.input_micros_per_token, 12);
        let all_active = store.with_conn(list_active).unwrap();
        assert_eq!(all_active.len(), 1);
    }

    #[test]
    fn deactivate_hides_the_model() {
        let store = Store::open_in_memory().unwrap();
        let p = ModelPricing::new("gemini-2.0-flash", 5, 15).unwrap();
        store.with_conn(|c| upsert(c, &p)).unwrap();
        assert!(store.with_conn(|c| deactivate(c, "gemini-2.0-flash")).unwrap());
        assert!(!store.with_conn(|c| deactivate(c, "gemini-2.0-flash")).unwrap());
        assert!(store
            .with_conn(|c| find_active_by_model(c, "gemini-2.0-flash"))
            .unwrap()
            .is_none());
    }
}
