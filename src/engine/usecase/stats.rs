// ── Chatvend Engine: Stats Use-Case ────────────────────────────────────────
// Aggregate counts for the /stats admin command. All reads, one pass.

use std::sync::Arc;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{AiJobStatus, ServiceStats};
use crate::engine::repos::{jobs, messages, payments, subscriptions, users};
use crate::engine::store::Store;

pub struct StatsService {
    store: Arc<Store>,
}

impl StatsService {
    pub fn new(store: Arc<Store>) -> Self {
        StatsService { store }
    }

    pub fn summary(&self) -> EngineResult<ServiceStats> {
        self.store.with_conn(|conn| {
            Ok(ServiceStats {
                total_users: users::count(conn)?,
                registered_users: users::count_registered(conn)?,
                active_subscriptions: subscriptions::count_active(conn)?,
                succeeded_payments: payments::count_succeeded(conn)?,
                revenue_irr: payments::revenue_irr(conn)?,
                jobs_completed: jobs::count_with_status(conn, AiJobStatus::Completed)?,
                messages_stored: messages::count_all(conn)?,
            })
        })
    }
}
