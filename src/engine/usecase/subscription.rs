// ── Chatvend Engine: Subscription Use-Case ─────────────────────────────────
// Grant, debit, and lifecycle sweep. `grant_in_tx` is a free function on
// purpose: the payment use-case calls it inside its own transaction so
// the status write, the grant and the purchase land atomically.

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::Connection;
use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{SubscriptionPlan, UserSubscription};
use crate::engine::repos::cached::CachedPlans;
use crate::engine::repos::{plans, subscriptions};
use crate::engine::store::Store;

/// Create the subscription a paid-up or code-redeeming user is owed.
/// With a live active subscription the new one is reserved and scheduled
/// to start when the active one expires; otherwise it activates now.
pub fn grant_in_tx(
    conn: &Connection,
    user_id: &str,
    plan: &SubscriptionPlan,
    now: DateTime<Utc>,
) -> EngineResult<UserSubscription> {
    let sub = match subscriptions::find_active_by_user(conn, user_id)? {
        Some(active) => {
            let scheduled = active.expires_at.unwrap_or(now);
            UserSubscription::new_reserved(user_id, plan, scheduled)
        }
        None => UserSubscription::new_active(user_id, plan, now),
    };
    subscriptions::insert(conn, &sub)?;
    info!(
        "[subscription] Granted {} plan {} to user {} ({})",
        sub.status, plan.name, user_id, sub.id
    );
    Ok(sub)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub finished: usize,
    pub activated: usize,
}

pub struct SubscriptionService {
    store: Arc<Store>,
    plans: Arc<CachedPlans>,
}

impl SubscriptionService {
    pub fn new(store: Arc<Store>, plans: Arc<CachedPlans>) -> Self {
        SubscriptionService { store, plans }
    }

    pub fn get_active(&self, user_id: &str) -> EngineResult<Option<UserSubscription>> {
        self.store.with_conn(|conn| subscriptions::find_active_by_user(conn, user_id))
    }

    pub fn get_reserved(&self, user_id: &str) -> EngineResult<Vec<UserSubscription>> {
        self.store.with_conn(|conn| subscriptions::list_reserved_by_user(conn, user_id))
    }

    /// Debit the active subscription; the conditional single-row update
    /// makes concurrent debits linearizable. Returns the new balance.
    pub fn deduct_credits(&self, user_id: &str, micros: i64) -> EngineResult<i64> {
        self.store.with_conn(|conn| subscriptions::deduct_credits(conn, user_id, micros))
    }

    /// Delete a plan unless an active or reserved subscription references
    /// it. Guard and delete share one transaction.
    pub async fn delete_plan(&self, plan_id: &str) -> EngineResult<()> {
        self.store.with_tx(|tx| {
            if plans::find_by_id(tx, plan_id)?.is_none() {
                return Err(EngineError::NotFound("plan"));
            }
            if subscriptions::plan_referenced(tx, plan_id)? {
                return Err(EngineError::SubscriptionWithActiveUser);
            }
            plans::delete(tx, plan_id)?;
            Ok(())
        })?;
        // Drop the decorator's keys now that the row is gone.
        let _ = self.plans.delete(plan_id).await;
        Ok(())
    }

    /// One sweep pass: finish expired actives, then promote due reserved
    /// rows. Each row transitions in its own transaction, so a crashed
    /// pass resumes cleanly and a repeated pass changes nothing.
    pub fn expiry_sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepOutcome> {
        const BATCH: usize = 200;
        let mut outcome = SweepOutcome::default();

        let expired = self.store.with_conn(|conn| subscriptions::list_expired_active(conn, now, BATCH))?;
        for sub in expired {
            let changed = self.store.with_tx(|tx| subscriptions::finish_active(tx, &sub.id))?;
            if changed {
                info!("[subscription] {} expired for user {}", sub.id, sub.user_id);
                outcome.finished += 1;
            }
        }

        let due = self.store.with_conn(|conn| subscriptions::list_due_reserved(conn, now, BATCH))?;
        for sub in due {
            let activated = self.store.with_tx(|tx| {
                // Re-check inside the transaction: an earlier row in this
                // pass may have activated a sibling already.
                if subscriptions::find_active_by_user(tx, &sub.user_id)?.is_some() {
                    return Ok(false);
                }
                let plan = plans::find_by_id(tx, &sub.plan_id)?
                    .ok_or(EngineError::NotFound("plan"))?;
                subscriptions::activate_reserved(tx, &sub.id, now, now + plan.duration())
            })?;
            if activated {
                info!("[subscription] Reserved {} activated for user {}", sub.id, sub.user_id);
                outcome.activated += 1;
            } else {
                warn!("[subscription] Reserved {} lost activation race", sub.id);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{SubscriptionStatus, User};
    use crate::engine::cache::MemoryCache;
    use crate::engine::repos::users;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn service() -> (Arc<Store>, SubscriptionService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let plans_repo = Arc::new(CachedPlans::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            StdDuration::from_secs(60),
        ));
        (store.clone(), SubscriptionService::new(store, plans_repo))
    }

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
    fn grant_without_active_is_immediate() {
        let (store, _svc) = service();
        let (user, plan) = seed(&store);
        let now = Utc::now();
        let sub = store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, now)).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.start_at, Some(now));
        assert_eq!(sub.expires_at, Some(now + Duration::days(30)));
        assert_eq!(sub.remaining_micros, 10_000_000);
    }

    #[test]
    fn grant_with_active_reserves_at_expiry() {
        let (store, _svc) = service();
        let (user, plan) = seed(&store);
        let now = Utc::now();
        let first = store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, now)).unwrap();
        let second = store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, now)).unwrap();
        assert_eq!(second.status, SubscriptionStatus::Reserved);
        assert_eq!(second.scheduled_start_at, first.expires_at);
        assert!(second.start_at.is_none());
    }

    #[test]
    fn sweep_finishes_expired_and_promotes_reserved() {
        let (store, svc) = service();
        let (user, plan) = seed(&store);
        let bought_at = Utc::now() - Duration::days(31);
        let s1 = store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, bought_at)).unwrap();
        let s2 = store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, bought_at)).unwrap();
        assert_eq!(s2.status, SubscriptionStatus::Reserved);

        let now = Utc::now();
        let outcome = svc.expiry_sweep(now).unwrap();
        assert_eq!(outcome, SweepOutcome { finished: 1, activated: 1 });

        let active = svc.get_active(&user.id).unwrap().unwrap();
        assert_eq!(active.id, s2.id);
        assert_eq!(active.start_at, Some(now));
        assert_eq!(active.expires_at, Some(now + Duration::days(30)));
        let old = store
            .with_conn(|c| subscriptions::find_by_id(c, &s1.id))
            .unwrap()
            .unwrap();
        assert_eq!(old.status, SubscriptionStatus::Finished);

        // Idempotence: a second pass with no time change does nothing.
        let outcome = svc.expiry_sweep(now).unwrap();
        assert_eq!(outcome, SweepOutcome::default());
    }

    #[test]
    fn sweep_promotes_earliest_reserved_only() {
        let (store, svc) = service();
        let (user, plan) = seed(&store);
        let now = Utc::now();
        let early = UserSubscription::new_reserved(&user.id, &plan, now - Duration::hours(2));
        let late = UserSubscription::new_reserved(&user.id, &plan, now - Duration::hours(1));
        store
            .with_conn(|conn| {
                subscriptions::insert(conn, &late)?;
                subscriptions::insert(conn, &early)
            })
            .unwrap();

        let outcome = svc.expiry_sweep(now).unwrap();
        assert_eq!(outcome.activated, 1);
        assert_eq!(svc.get_active(&user.id).unwrap().unwrap().id, early.id);
        // The later one stays reserved until the new active expires.
        let reserved = svc.get_reserved(&user.id).unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].id, late.id);
    }

    #[tokio::test]
    async fn plan_delete_guard() {
        let (store, svc) = service();
        let (user, plan) = seed(&store);
        store.with_tx(|tx| grant_in_tx(tx, &user.id, &plan, Utc::now())).unwrap();

        let err = svc.delete_plan(&plan.id).await.unwrap_err();
        assert!(matches!(err, EngineError::SubscriptionWithActiveUser));

        // Finished references do not block deletion.
        let active = svc.get_active(&user.id).unwrap().unwrap();
        store.with_tx(|tx| subscriptions::finish_active(tx, &active.id)).unwrap();
        svc.delete_plan(&plan.id).await.unwrap();
        assert!(store.with_conn(|c| plans::find_by_id(c, &plan.id)).unwrap().is_none());
    }
}
