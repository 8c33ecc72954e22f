// ── Chatvend Engine: Transactional Store ───────────────────────────────────
// SQLite via rusqlite behind a single mutex-guarded connection (WAL mode).
//
// Transaction discipline: `with_tx` is the only multi-row atomicity
// mechanism in the crate. `rusqlite::Transaction` derefs to `Connection`,
// so every repository function takes `&Connection` and runs unchanged
// inside a transaction or on the shared connection. Because SQLite has a
// single writer and the connection is mutex-guarded, a conditional
// `UPDATE … RETURNING` claim admits at most one claimant per row.

use log::info;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::atoms::error::EngineResult;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &str) -> EngineResult<Self> {
        info!("[store] Opening database at {}", path);
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` on the shared connection, outside any transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction: commit on Ok, roll back on
    /// Err (rusqlite rolls back on drop).
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

// Schema is idempotent; status columns hold the lowercase enum text and
// every transition goes through a conditional UPDATE. The partial unique
// indexes carry the two at-most-one-active invariants.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        tg_user_id INTEGER NOT NULL UNIQUE CHECK (tg_user_id > 0),
        display_name TEXT NOT NULL DEFAULT '',
        registration_status TEXT NOT NULL DEFAULT 'pending',
        is_admin INTEGER NOT NULL DEFAULT 0,
        allow_message_storage INTEGER NOT NULL DEFAULT 1,
        auto_delete INTEGER NOT NULL DEFAULT 0,
        retention_days INTEGER NOT NULL DEFAULT 30 CHECK (retention_days >= 0),
        data_encrypted INTEGER NOT NULL DEFAULT 0,
        encryption_key_id TEXT,
        registered_at TEXT NOT NULL,
        last_active_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS plans (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        duration_days INTEGER NOT NULL CHECK (duration_days > 0),
        credit_micros INTEGER NOT NULL CHECK (credit_micros >= 0),
        price_irr INTEGER NOT NULL CHECK (price_irr > 0),
        supported_models TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS subscriptions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        plan_id TEXT NOT NULL REFERENCES plans(id),
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        scheduled_start_at TEXT,
        start_at TEXT,
        expires_at TEXT,
        remaining_micros INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_one_active
        ON subscriptions(user_id) WHERE status = 'active';
    CREATE INDEX IF NOT EXISTS idx_subscriptions_expiry
        ON subscriptions(status, expires_at);
    CREATE INDEX IF NOT EXISTS idx_subscriptions_scheduled
        ON subscriptions(status, scheduled_start_at);

    CREATE TABLE IF NOT EXISTS payments (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        plan_id TEXT NOT NULL REFERENCES plans(id),
        provider TEXT NOT NULL,
        amount_irr INTEGER NOT NULL,
        currency TEXT NOT NULL DEFAULT 'IRR',
        authority TEXT,
        ref_id TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        paid_at TEXT,
        callback_url TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        metadata TEXT NOT NULL DEFAULT '{}',
        subscription_id TEXT,
        activation_code TEXT,
        activation_expires_at TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_authority
        ON payments(provider, authority) WHERE authority IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_payments_status
        ON payments(status, created_at);

    CREATE TABLE IF NOT EXISTS purchases (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        plan_id TEXT NOT NULL REFERENCES plans(id),
        payment_id TEXT NOT NULL UNIQUE REFERENCES payments(id) ON DELETE CASCADE,
        subscription_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS activation_codes (
        id TEXT PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        plan_id TEXT NOT NULL REFERENCES plans(id),
        is_redeemed INTEGER NOT NULL DEFAULT 0,
        redeemed_by_user_id TEXT,
        redeemed_at TEXT,
        expires_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chat_sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        model TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_sessions_one_active
        ON chat_sessions(user_id) WHERE status = 'active';

    CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        tokens INTEGER NOT NULL DEFAULT 0,
        encrypted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chat_messages_session
        ON chat_messages(session_id, created_at);

    CREATE TABLE IF NOT EXISTS ai_jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
        user_message_id TEXT,
        payload_text TEXT,
        retries INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_ai_jobs_queue
        ON ai_jobs(status, created_at);

    CREATE TABLE IF NOT EXISTS model_pricing (
        id TEXT PRIMARY KEY,
        model_name TEXT NOT NULL,
        input_micros_per_token INTEGER NOT NULL CHECK (input_micros_per_token >= 0),
        output_micros_per_token INTEGER NOT NULL CHECK (output_micros_per_token >= 0),
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_model_pricing_one_active
        ON model_pricing(model_name) WHERE active = 1;

    CREATE TABLE IF NOT EXISTS notification_log (
        subscription_id TEXT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        threshold_days INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (subscription_id, kind, threshold_days)
    );
";
