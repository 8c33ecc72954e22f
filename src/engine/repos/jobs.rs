// ── Chatvend Engine: AI Job Repository ─────────────────────────────────────
// Durable turn queue. `claim_next` flips the oldest pending row to
// processing in one conditional UPDATE … RETURNING; with SQLite's single
// writer that is the whole claim protocol, so two workers can never hold
// the same job.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{AiJob, AiJobStatus};

use super::{parse_ts, ts};

pub fn enqueue(conn: &Connection, job: &AiJob) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO ai_jobs (id, status, session_id, user_message_id, payload_text,
            retries, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job.id,
            job.status.as_str(),
            job.session_id,
            job.user_message_id,
            job.payload_text,
            job.retries,
            job.last_error,
            ts(job.created_at),
            ts(job.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<AiJob>> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// Claim the oldest pending job: pending → processing, returning the
/// claimed row, or None when the queue is empty. Sessions with a job
/// already in flight are skipped so a user's turns complete in the order
/// they were sent even with a worker pool.
pub fn claim_next(conn: &Connection, now: DateTime<Utc>) -> EngineResult<Option<AiJob>> {
    let mut stmt = conn.prepare(
        "UPDATE ai_jobs SET status = 'processing', updated_at = ?1
         WHERE id = (SELECT id FROM ai_jobs WHERE status = 'pending'
                     AND session_id NOT IN
                         (SELECT session_id FROM ai_jobs WHERE status = 'processing')
                     ORDER BY created_at ASC LIMIT 1)
         RETURNING id, status, session_id, user_message_id, payload_text,
                   retries, last_error, created_at, updated_at",
    )?;
    let mut rows = stmt.query(params![ts(now)])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// processing → completed.
pub fn complete(conn: &Connection, id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE ai_jobs SET status = 'completed', updated_at = ?2
         WHERE id = ?1 AND status = 'processing'",
        params![id, ts(now)],
    )?;
    Ok(n == 1)
}

/// processing → failed, terminally.
pub fn fail(conn: &Connection, id: &str, error: &str, now: DateTime<Utc>) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE ai_jobs SET status = 'failed', last_error = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'processing'",
        params![id, error, ts(now)],
    )?;
    Ok(n == 1)
}

/// processing → pending with the retry counter bumped; used for transient
/// LLM failures while retries remain.
pub fn retry(conn: &Connection, id: &str, error: &str, now: DateTime<Utc>) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE ai_jobs SET status = 'pending', retries = retries + 1, last_error = ?2,
            updated_at = ?3
         WHERE id = ?1 AND status = 'processing'",
        params![id, error, ts(now)],
    )?;
    Ok(n == 1)
}

pub fn count_with_status(conn: &Connection, status: AiJobStatus) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM ai_jobs WHERE status = ?1",
        params![status.as_str()],
        |r| r.get(0),
    )?)
}

const SELECT: &str = "SELECT id, status, session_id, user_message_id, payload_text, retries,
    last_error, created_at, updated_at FROM ai_jobs";

fn from_row(row: &Row<'_>) -> EngineResult<AiJob> {
    let status: String = row.get(1)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(AiJob {
        id: row.get(0)?,
        status: status.parse::<AiJobStatus>()?,
        session_id: row.get(2)?,
        user_message_id: row.get(3)?,
        payload_text: row.get(4)?,
        retries: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
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
    fn claim_is_fifo_and_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let session = seed(&store);
        let mut first = AiJob::new(&session.id, Some("m1".into()), None);
        first.created_at = Utc::now() - Duration::seconds(10);
        let second = AiJob::new(&session.id, Some("m2".into()), None);
        store
            .with_conn(|conn| {
                enqueue(conn, &second)?;
                enqueue(conn, &first)
            })
            .unwrap();

        let now = Utc::now();
        let a = store.with_conn(|c| claim_next(c, now)).unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(a.status, AiJobStatus::Processing);

        // Same session: the second job stays queued until the first turn
        // finishes, preserving per-user reply order.
        assert!(store.with_conn(|c| claim_next(c, now)).unwrap().is_none());
        store.with_conn(|c| complete(c, &first.id, now)).unwrap();

        let b = store.with_conn(|c| claim_next(c, now)).unwrap().unwrap();
        assert_eq!(b.id, second.id);
        assert!(store.with_conn(|c| claim_next(c, now)).unwrap().is_none());
    }

    #[test]
    fn retry_requeues_with_counter() {
        let store = Store::open_in_memory().unwrap();
        let session = seed(&store);
        let job = AiJob::new(&session.id, Some("m1".into()), None);
        store.with_conn(|c| enqueue(c, &job)).unwrap();
        let now = Utc::now();

        store.with_conn(|c| claim_next(c, now)).unwrap().unwrap();
        assert!(store.with_conn(|c| retry(c, &job.id, "timeout", now)).unwrap());

        let back = store.with_conn(|c| claim_next(c, now)).unwrap().unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.retries, 1);
        assert_eq!(back.last_error.as_deref(), Some("timeout"));
        assert!(store.with_conn(|c| fail(c, &job.id, "gave up", now)).unwrap());
        assert!(!store.with_conn(|c| complete(c, &job.id, now)).unwrap());
    }
}
