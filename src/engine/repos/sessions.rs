// ── Chatvend Engine: Chat Session Repository ───────────────────────────────
// One active session per user, backed by the partial unique index; the
// finish/reactivate pair are conditional transitions the chat use-case
// composes inside a transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChatSession, ChatSessionStatus};

use super::{parse_ts, ts};

pub fn insert(conn: &Connection, s: &ChatSession) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO chat_sessions (id, user_id, model, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![s.id, s.user_id, s.model, s.status.as_str(), ts(s.created_at), ts(s.updated_at)],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<ChatSession>> {
    query_one(conn, &format!("{} WHERE id = ?1", SELECT), params![id])
}

pub fn find_active_by_user(conn: &Connection, user_id: &str) -> EngineResult<Option<ChatSession>> {
    query_one(
        conn,
        &format!("{} WHERE user_id = ?1 AND status = 'active'", SELECT),
        params![user_id],
    )
}

pub fn list_by_user(conn: &Connection, user_id: &str) -> EngineResult<Vec<ChatSession>> {
    let mut stmt =
        conn.prepare(&format!("{} WHERE user_id = ?1 ORDER BY updated_at DESC", SELECT))?;
    let mut rows = stmt.query(params![user_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

/// active → finished.
pub fn finish(conn: &Connection, id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE chat_sessions SET status = 'finished', updated_at = ?2
         WHERE id = ?1 AND status = 'active'",
        params![id, ts(now)],
    )?;
    Ok(n == 1)
}

/// finished → active, for switching back to an older session. The caller
/// must have finished the current active session in the same transaction.
pub fn reactivate(conn: &Connection, id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE chat_sessions SET status = 'active', updated_at = ?2
         WHERE id = ?1 AND status = 'finished'",
        params![id, ts(now)],
    )?;
    Ok(n == 1)
}

pub fn touch(conn: &Connection, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
    conn.execute("UPDATE chat_sessions SET updated_at = ?2 WHERE id = ?1", params![id, ts(now)])?;
    Ok(())
}

/// Physical delete; messages and jobs go with it via cascade.
pub fn delete(conn: &Connection, id: &str) -> EngineResult<bool> {
    let n = conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
    Ok(n == 1)
}

const SELECT: &str = "SELECT id, user_id, model, status, created_at, updated_at FROM chat_sessions";

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Option<ChatSession>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

fn from_row(row: &Row<'_>) -> EngineResult<ChatSession> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        model: row.get(2)?,
        status: status.parse::<ChatSessionStatus>()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
