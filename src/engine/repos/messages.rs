// ── Chatvend Engine: Chat Message Repository ───────────────────────────────
// Append-only log. Content may be AES-GCM ciphertext (encrypted flag);
// this layer stores bytes-as-text and leaves crypto to the services.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{ChatMessage, ChatRole};

use super::{parse_ts, ts};

pub fn insert(conn: &Connection, m: &ChatMessage) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, role, content, tokens, encrypted, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![m.id, m.session_id, m.role.as_str(), m.content, m.tokens, m.encrypted, ts(m.created_at)],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<ChatMessage>> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// The most recent `limit` messages of a session, oldest first, ready to
/// become the prompt window.
pub fn list_recent(
    conn: &Connection,
    session_id: &str,
    limit: usize,
) -> EngineResult<Vec<ChatMessage>> {
    // rowid breaks same-instant ties in insertion order.
    let mut stmt = conn.prepare(&format!(
        "{} WHERE session_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        SELECT
    ))?;
    let mut rows = stmt.query(params![session_id, limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    out.reverse();
    Ok(out)
}

pub fn count_for_session(conn: &Connection, session_id: &str) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1",
        params![session_id],
        |r| r.get(0),
    )?)
}

pub fn count_all(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |r| r.get(0))?)
}

/// Retention purge: delete a user's messages older than the cutoff.
/// Returns the number of rows removed.
pub fn delete_older_than(
    conn: &Connection,
    user_id: &str,
    cutoff: DateTime<Utc>,
) -> EngineResult<usize> {
    let n = conn.execute(
        "DELETE FROM chat_messages WHERE created_at < ?2 AND session_id IN
            (SELECT id FROM chat_sessions WHERE user_id = ?1)",
        params![user_id, ts(cutoff)],
    )?;
    Ok(n)
}

const SELECT: &str =
    "SELECT id, session_id, role, content, tokens, encrypted, created_at FROM chat_messages";

fn from_row(row: &Row<'_>) -> EngineResult<ChatMessage> {
    let role: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse::<ChatRole>()?,
        content: row.get(3)?,
        tokens: row.get(4)?,
        encrypted: row.get(5)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ChatSession, User};
    use crate::engine::repos::{sessions, users};
    use crate::engine::store::Store;
    use chrono::Duration;

    fn seed(store: &Store) -> ChatSession {
        let user = User::new(42, "Ada").unwrap();
        let session = ChatSession::new(&user.id, "gpt-4o-mini");
        store
            .with_conn(|conn| {
                users::insert(conn, &user)?;
                sessions::insert(conn, &session)
            })
            .unwrap();
        session
    }

    #[test]
    fn recent_window_is_oldest_first_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        let session = seed(&store);
        store
            .with_conn(|conn| {
                for i in 0..20 {
                    let mut m = ChatMessage::new(
                        &session.id,
                        ChatRole::User,
                        format!("msg-{}", i),
                        1,
                        false,
                    );
                    m.created_at = Utc::now() + Duration::milliseconds(i);
                    insert(conn, &m)?;
                }
                Ok(())
            })
            .unwrap();

        let window = store.with_conn(|c| list_recent(c, &session.id, 15)).unwrap();
        assert_eq!(window.len(), 15);
        assert_eq!(window.first().unwrap().content, "msg-5");
        assert_eq!(window.last().unwrap().content, "msg-19");
    }

    #[test]
    fn retention_purge_only_hits_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let session = seed(&store);
        let now = Utc::now();
        store
            .with_conn(|conn| {
                let mut old =
                    ChatMessage::new(&session.id, ChatRole::User, "old".into(), 1, false);
                old.created_at = now - Duration::days(40);
                let fresh = ChatMessage::new(&session.id, ChatRole::User, "fresh".into(), 1, false);
                insert(conn, &old)?;
                insert(conn, &fresh)
            })
            .unwrap();

        let removed = store
            .with_conn(|c| delete_older_than(c, &session.user_id, now - Duration::days(30)))
            .unwrap();
        assert_eq!(removed, 1);
        let left = store.with_conn(|c| list_recent(c, &session.id, 10)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "fresh");
    }
}
