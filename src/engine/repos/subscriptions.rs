// ── Chatvend Engine: Subscription Repository ───────────────────────────────
// The two load-bearing writes live here:
//   • `deduct_credits` is a single conditional UPDATE, so concurrent
//     debits on the same subscription linearize.
//   • `finish_active` / `activate_reserved` are conditional status
//     transitions; a false return means another worker won the race.
// The partial unique index on (user_id) WHERE status='active' backs the
// at-most-one-active invariant even against buggy callers.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{SubscriptionStatus, UserSubscription};

use super::{opt_ts, parse_opt_ts, parse_ts, ts};

pub fn insert(conn: &Connection, sub: &UserSubscription) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO subscriptions (id, user_id, plan_id, status, created_at,
            scheduled_start_at, start_at, expires_at, remaining_micros)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            sub.id,
            sub.user_id,
            sub.plan_id,
            sub.status.as_str(),
            ts(sub.created_at),
            opt_ts(sub.scheduled_start_at),
            opt_ts(sub.start_at),
            opt_ts(sub.expires_at),
            sub.remaining_micros,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<UserSubscription>> {
    query_one(conn, &format!("{} WHERE id = ?1", SELECT), params![id])
}

pub fn find_active_by_user(conn: &Connection, user_id: &str) -> EngineResult<Option<UserSubscription>> {
    query_one(conn, &format!("{} WHERE user_id = ?1 AND status = 'active'", SELECT), params![user_id])
}

/// Reserved rows for a user, activation order first.
pub fn list_reserved_by_user(conn: &Connection, user_id: &str) -> EngineResult<Vec<UserSubscription>> {
    query_all(
        conn,
        &format!(
            "{} WHERE user_id = ?1 AND status = 'reserved'
             ORDER BY scheduled_start_at ASC, created_at ASC",
            SELECT
        ),
        params![user_id],
    )
}

/// Debit the user's active subscription. Fails with `InsufficientBalance`
/// without touching the row when the balance cannot cover `micros`, and
/// with `NoActiveSubscription` when there is nothing to debit.
pub fn deduct_credits(conn: &Connection, user_id: &str, micros: i64) -> EngineResult<i64> {
    if micros < 0 {
        return Err(EngineError::InvalidArgument(format!("negative debit: {}", micros)));
    }
    let mut stmt = conn.prepare(
        "UPDATE subscriptions SET remaining_micros = remaining_micros - ?2
         WHERE user_id = ?1 AND status = 'active' AND remaining_micros >= ?2
         RETURNING remaining_micros",
    )?;
    let mut rows = stmt.query(params![user_id, micros])?;
    if let Some(row) = rows.next()? {
        return Ok(row.get(0)?);
    }
    match find_active_by_user(conn, user_id)? {
        Some(active) => Err(EngineError::InsufficientBalance {
            required: micros,
            remaining: active.remaining_micros,
        }),
        None => Err(EngineError::NoActiveSubscription),
    }
}

/// active → finished. Returns whether this call made the transition.
pub fn finish_active(conn: &Connection, id: &str) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE subscriptions SET status = 'finished' WHERE id = ?1 AND status = 'active'",
        params![id],
    )?;
    Ok(n == 1)
}

/// reserved → active with the period stamped. Returns whether this call
/// made the transition.
pub fn activate_reserved(
    conn: &Connection,
    id: &str,
    start_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> EngineResult<bool> {
    let n = conn.execute(
        "UPDATE subscriptions SET status = 'active', start_at = ?2, expires_at = ?3,
            scheduled_start_at = NULL
         WHERE id = ?1 AND status = 'reserved'",
        params![id, ts(start_at), ts(expires_at)],
    )?;
    Ok(n == 1)
}

/// Active rows whose period has ended.
pub fn list_expired_active(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> EngineResult<Vec<UserSubscription>> {
    query_all(
        conn,
        &format!(
            "{} WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC LIMIT ?2",
            SELECT
        ),
        params![ts(now), limit as i64],
    )
}

/// Reserved rows whose scheduled start has elapsed and whose user has no
/// active sibling. Ordered so the earliest schedule (then creation) wins
/// the per-user tie-break.
pub fn list_due_reserved(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> EngineResult<Vec<UserSubscription>> {
    query_all(
        conn,
        &format!(
            "{} WHERE status = 'reserved' AND scheduled_start_at IS NOT NULL
               AND scheduled_start_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM subscriptions a
                   WHERE a.user_id = subscriptions.user_id AND a.status = 'active')
             ORDER BY scheduled_start_at ASC, created_at ASC LIMIT ?2",
            SELECT
        ),
        params![ts(now), limit as i64],
    )
}

/// Active rows expiring within `days` (exclusive of already expired), for
/// the warning pass.
pub fn list_active_expiring_within(
    conn: &Connection,
    now: DateTime<Utc>,
    days: i64,
) -> EngineResult<Vec<UserSubscription>> {
    query_all(
        conn,
        &format!(
            "{} WHERE status = 'active' AND expires_at IS NOT NULL
               AND expires_at > ?1 AND expires_at <= ?2",
            SELECT
        ),
        params![ts(now), ts(now + Duration::days(days))],
    )
}

/// Plan delete guard predicate.
pub fn plan_referenced(conn: &Connection, plan_id: &str) -> EngineResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subscriptions
         WHERE plan_id = ?1 AND status IN ('active', 'reserved')",
        params![plan_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn count_active(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM subscriptions WHERE status = 'active'",
        [],
        |r| r.get(0),
    )?)
}

const SELECT: &str = "SELECT id, user_id, plan_id, status, created_at, scheduled_start_at,
    start_at, expires_at, remaining_micros FROM subscriptions";

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Option<UserSubscription>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

fn query_all(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> EngineResult<Vec<UserSubscription>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

fn from_row(row: &Row<'_>) -> EngineResult<UserSubscription> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(UserSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        status: status.parse::<SubscriptionStatus>()?,
        created_at: parse_ts(&created_at)?,
        scheduled_start_at: parse_opt_ts(row.get(5)?)?,
        start_at: parse_opt_ts(row.get(6)?)?,
        expires_at: parse_opt_ts(row.get(7)?)?,
        remaining_micros: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{SubscriptionPlan, User};
    use crate::engine::repos::{plans, users};
    use crate::engine::store::Store;

    fn seed(store: &Store) -> (User, SubscriptionPlan) {
        let user = User::new(42, "Ada").unwrap();
        let plan = SubscriptionPlan::new("basic", 30, 10_000_000, 500_000, vec![]).unwrap();
        store
            .with_conn(|conn| {
                users::insert(conn, &user)?;
                plans::insert(conn, &plan)
            })
            .unwrap();
        (user, plan)
    }

    #[test]
    fn deduct_exact_balance_reaches_zero() {
        let store = Store::open_in_memory().unwrap();
        let (user, plan) = seed(&store);
        let mut sub = UserSubscription::new_active(&user.id, &plan, Utc::now());
        sub.remaining_micros = 50;
        store.with_conn(|conn| insert(conn, &sub)).unwrap();

        let left = store.with_conn(|conn| deduct_credits(conn, &user.id, 50)).unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn deduct_one_over_balance_fails_untouched() {
        let store = Store::open_in_memory().unwrap();
        let (user, plan) = seed(&store);
        let mut sub = UserSubscription::new_active(&user.id, &plan, Utc::now());
        sub.remaining_micros = 49;
        store.with_conn(|conn| insert(conn, &sub)).unwrap();

        let err = store.with_conn(|conn| deduct_credits(conn, &user.id, 50)).unwrap_err();
        match err {
            EngineError::InsufficientBalance { required, remaining } => {
                assert_eq!(required, 50);
                assert_eq!(remaining, 49);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let back = store
            .with_conn(|conn| find_active_by_user(conn, &user.id))
            .unwrap()
            .unwrap();
        assert_eq!(back.remaining_micros, 49);
    }

    #[test]
    fn deduct_without_active_subscription() {
        let store = Store::open_in_memory().unwrap();
        let (user, _plan) = seed(&store);
        let err = store.with_conn(|conn| deduct_credits(conn, &user.id, 1)).unwrap_err();
        assert!(matches!(err, EngineError::NoActiveSubscription));
    }

    #[test]
    fn conditional_transitions_report_races() {
        let store = Store::open_in_memory().unwrap();
        let (user, plan) = seed(&store);
        let sub = UserSubscription::new_active(&user.id, &plan, Utc::now());
        store.with_conn(|conn| insert(conn, &sub)).unwrap();

        assert!(store.with_conn(|conn| finish_active(conn, &sub.id)).unwrap());
        // Second transition finds no active row.
        assert!(!store.with_conn(|conn| finish_active(conn, &sub.id)).unwrap());
    }

    #[test]
    fn due_reserved_excludes_users_with_active() {
        let store = Store::open_in_memory().unwrap();
        let (user, plan) = seed(&store);
        let now = Utc::now();
        let active = UserSubscription::new_active(&user.id, &plan, now);
        let reserved =
            UserSubscription::new_reserved(&user.id, &plan, now - Duration::minutes(1));
        store
            .with_conn(|conn| {
                insert(conn, &active)?;
                insert(conn, &reserved)
            })
            .unwrap();

        let due = store.with_conn(|conn| list_due_reserved(conn, now, 10)).unwrap();
        assert!(due.is_empty());

        store.with_conn(|conn| finish_active(conn, &active.id)).unwrap();
        let due = store.with_conn(|conn| list_due_reserved(conn, now, 10)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, reserved.id);
    }

    #[test]
    fn plan_guard_sees_reserved_rows() {
        let store = Store::open_in_memory().unwrap();
        let (user, plan) = seed(&store);
        let reserved = UserSubscription::new_reserved(&user.id, &plan, Utc::now());
        store.with_conn(|conn| insert(conn, &reserved)).unwrap();
        assert!(store.with_conn(|conn| plan_referenced(conn, &plan.id)).unwrap());

        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE subscriptions SET status = 'finished' WHERE id = ?1",
                    params![reserved.id],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(!store.with_conn(|conn| plan_referenced(conn, &plan.id)).unwrap());
    }
}
