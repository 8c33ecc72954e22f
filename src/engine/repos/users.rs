// ── Chatvend Engine: User Repository ───────────────────────────────────────
// Privacy settings are embedded columns; both lookups (by id and by
// Telegram id) return the full aggregate.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::atoms::error::EngineResult;
use crate::atoms::types::{PrivacySettings, RegistrationStatus, User};

use super::{parse_ts, ts};

pub fn insert(conn: &Connection, user: &User) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO users (id, tg_user_id, display_name, registration_status, is_admin,
            allow_message_storage, auto_delete, retention_days, data_encrypted,
            encryption_key_id, registered_at, last_active_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            user.id,
            user.tg_user_id,
            user.display_name,
            user.registration_status.as_str(),
            user.is_admin,
            user.privacy.allow_message_storage,
            user.privacy.auto_delete,
            user.privacy.retention_days,
            user.privacy.data_encrypted,
            user.privacy.encryption_key_id,
            ts(user.registered_at),
            ts(user.last_active_at),
        ],
    )?;
    Ok(())
}

/// Persist the mutable parts of the aggregate (name, registration,
/// privacy, activity). Identity columns never change.
pub fn update(conn: &Connection, user: &User) -> EngineResult<()> {
    conn.execute(
        "UPDATE users SET display_name = ?2, registration_status = ?3, is_admin = ?4,
            allow_message_storage = ?5, auto_delete = ?6, retention_days = ?7,
            data_encrypted = ?8, encryption_key_id = ?9, last_active_at = ?10
         WHERE id = ?1",
        params![
            user.id,
            user.display_name,
            user.registration_status.as_str(),
            user.is_admin,
            user.privacy.allow_message_storage,
            user.privacy.auto_delete,
            user.privacy.retention_days,
            user.privacy.data_encrypted,
            user.privacy.encryption_key_id,
            ts(user.last_active_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> EngineResult<Option<User>> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

pub fn find_by_tg_id(conn: &Connection, tg_user_id: i64) -> EngineResult<Option<User>> {
    let mut stmt = conn.prepare(&format!("{} WHERE tg_user_id = ?1", SELECT))?;
    let mut rows = stmt.query(params![tg_user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

pub fn touch_last_active(conn: &Connection, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
    conn.execute("UPDATE users SET last_active_at = ?2 WHERE id = ?1", params![id, ts(now)])?;
    Ok(())
}

/// Users with auto-delete enabled, for the retention purge.
pub fn list_auto_delete(conn: &Connection) -> EngineResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!("{} WHERE auto_delete = 1", SELECT))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(from_row(row)?);
    }
    Ok(out)
}

pub fn count(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

pub fn count_registered(conn: &Connection) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users WHERE registration_status = 'completed'",
        [],
        |r| r.get(0),
    )?)
}

const SELECT: &str = "SELECT id, tg_user_id, display_name, registration_status, is_admin,
    allow_message_storage, auto_delete, retention_days, data_encrypted, encryption_key_id,
    registered_at, last_active_at FROM users";

fn from_row(row: &Row<'_>) -> EngineResult<User> {
    let status: String = row.get(3)?;
    let registered_at: String = row.get(10)?;
    let last_active_at: String = row.get(11)?;
    Ok(User {
        id: row.get(0)?,
        tg_user_id: row.get(1)?,
        display_name: row.get(2)?,
        registration_status: status.parse::<RegistrationStatus>()?,
        is_admin: row.get(4)?,
        privacy: PrivacySettings {
            allow_message_storage: row.get(5)?,
            auto_delete: row.get(6)?,
            retention_days: row.get(7)?,
            data_encrypted: row.get(8)?,
            encryption_key_id: row.get(9)?,
        },
        registered_at: parse_ts(&registered_at)?,
        last_active_at: parse_ts(&last_active_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::Store;

    #[test]
    fn insert_and_find_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let user = User::new(42, "Ada").unwrap();
        store.with_conn(|conn| insert(conn, &user)).unwrap();

        let by_id = store.with_conn(|conn| find_by_id(conn, &user.id)).unwrap().unwrap();
        assert_eq!(by_id.tg_user_id, 42);
        assert_eq!(by_id.display_name, "Ada");
        assert_eq!(by_id.registration_status, RegistrationStatus::Pending);
        assert_eq!(by_id.privacy, PrivacySettings::default());

        let by_tg = store.with_conn(|conn| find_by_tg_id(conn, 42)).unwrap().unwrap();
        assert_eq!(by_tg.id, user.id);
        assert!(store.with_conn(|conn| find_by_tg_id(conn, 43)).unwrap().is_none());
    }

    #[test]
    fn update_persists_privacy_and_registration() {
        let store = Store::open_in_memory().unwrap();
        let mut user = User::new(42, "Ada").unwrap();
        store.with_conn(|conn| insert(conn, &user)).unwrap();

        user.registration_status = RegistrationStatus::Completed;
        user.privacy.allow_message_storage = false;
        user.privacy.data_encrypted = true;
        user.privacy.retention_days = 7;
        store.with_conn(|conn| update(conn, &user)).unwrap();

        let back = store.with_conn(|conn| find_by_id(conn, &user.id)).unwrap().unwrap();
        assert!(back.is_registered());
        assert!(!back.privacy.allow_message_storage);
        assert!(back.privacy.data_encrypted);
        assert_eq!(back.privacy.retention_days, 7);
        assert_eq!(store.with_conn(count_registered).unwrap(), 1);
    }

    #[test]
    fn duplicate_telegram_id_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let a = User::new(42, "Ada").unwrap();
        let b = User::new(42, "Bob").unwrap();
        store.with_conn(|conn| insert(conn, &a)).unwrap();
        assert!(store.with_conn(|conn| insert(conn, &b)).is_err());
    }
}
