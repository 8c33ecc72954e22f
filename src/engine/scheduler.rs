// ── Chatvend Engine: Schedulers ────────────────────────────────────────────
// Two singleton loops:
//   • Expiry: fires on the configured cron schedule; runs the
//     subscription sweep, the expiry warnings, and the retention purge.
//     Ticks never overlap (one sequential loop) and a missed tick is
//     harmless since every predicate is time-based.
//   • Reconciler: every ten minutes, re-verifies stale pending payments.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::atoms::constants::{EXPIRY_WARN_THRESHOLD_DAYS, RECONCILE_INTERVAL_SECS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::OutboundMessage;
use crate::engine::messenger::Messenger;
use crate::engine::repos::{messages, notifications, subscriptions, users};
use crate::engine::store::Store;
use crate::engine::usecase::payment::PaymentService;
use crate::engine::usecase::subscription::SubscriptionService;

pub struct Scheduler {
    store: Arc<Store>,
    subscriptions: Arc<SubscriptionService>,
    payments: Arc<PaymentService>,
    messenger: Arc<dyn Messenger>,
    schedule: Schedule,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        subscriptions: Arc<SubscriptionService>,
        payments: Arc<PaymentService>,
        messenger: Arc<dyn Messenger>,
        schedule: Schedule,
    ) -> Self {
        Scheduler { store, subscriptions, payments, messenger, schedule }
    }

    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let expiry = {
            let this = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move { this.run_expiry_loop(stop).await })
        };
        let reconcile = tokio::spawn(async move { self.run_reconcile_loop(stop).await });
        vec![expiry, reconcile]
    }

    async fn run_expiry_loop(&self, stop: Arc<AtomicBool>) {
        info!("[scheduler] Expiry loop up ({})", self.schedule);
        while !stop.load(Ordering::Relaxed) {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                warn!("[scheduler] Cron schedule yields no future fire time, stopping");
                return;
            };
            if !sleep_until(next, &stop).await {
                break;
            }
            let now = Utc::now();
            if let Err(e) = self.expiry_tick(now).await {
                error!("[scheduler] Expiry tick failed: {}", e);
            }
        }
        info!("[scheduler] Expiry loop stopped");
    }

    async fn run_reconcile_loop(&self, stop: Arc<AtomicBool>) {
        info!("[scheduler] Payment reconciler up");
        while !stop.load(Ordering::Relaxed) {
            if !sleep_for(Duration::from_secs(RECONCILE_INTERVAL_SECS), &stop).await {
                break;
            }
            if let Err(e) = self.payments.reconcile_pending().await {
                error!("[scheduler] Reconcile pass failed: {}", e);
            }
        }
        info!("[scheduler] Payment reconciler stopped");
    }

    /// One expiry tick: sweep, then warnings, then retention purge.
    /// Public so tests can drive it at a chosen instant.
    pub async fn expiry_tick(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let outcome = self.subscriptions.expiry_sweep(now)?;
        if outcome.finished > 0 || outcome.activated > 0 {
            info!(
                "[scheduler] Sweep: {} finished, {} activated",
                outcome.finished, outcome.activated
            );
        }
        self.send_expiry_warnings(now).await?;
        self.retention_purge(now)?;
        Ok(())
    }

    /// "Expires in N days" warnings, once per (subscription, threshold).
    /// Thresholds run nearest-first so a subscription inside several
    /// windows gets a single message per tick.
    async fn send_expiry_warnings(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let mut thresholds = EXPIRY_WARN_THRESHOLD_DAYS;
        thresholds.sort_unstable();
        let mut warned: HashSet<String> = HashSet::new();

        for threshold in thresholds {
            let expiring = self
                .store
                .with_conn(|conn| subscriptions::list_active_expiring_within(conn, now, threshold))?;
            for sub in expiring {
                if warned.contains(&sub.id) {
                    continue;
                }
                let fresh = self.store.with_conn(|conn| {
                    notifications::try_mark(
                        conn,
                        &sub.id,
                        notifications::KIND_EXPIRY_WARNING,
                        threshold,
                    )
                })?;
                if !fresh {
                    continue;
                }
                warned.insert(sub.id.clone());
                let Some(user) =
                    self.store.with_conn(|conn| users::find_by_id(conn, &sub.user_id))?
                else {
                    continue;
                };
                let days_left = sub
                    .expires_at
                    .map(|t| ((t - now) + ChronoDuration::hours(23)).num_days().max(1))
                    .unwrap_or(threshold);
                let text = format!(
                    "⏳ Your subscription expires in about {} day{}. Renew with /plans to keep your credits flowing.",
                    days_left,
                    if days_left == 1 { "" } else { "s" }
                );
                if let Err(e) =
                    self.messenger.send_message(OutboundMessage::text(user.tg_user_id, text)).await
                {
                    warn!("[scheduler] Expiry warning to {} failed: {}", user.tg_user_id, e);
                }
            }
        }
        Ok(())
    }

    /// Delete messages past their owner's retention window (auto-delete
    /// users only).
    fn retention_purge(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let candidates = self.store.with_conn(users::list_auto_delete)?;
        for user in candidates {
            let cutoff = now - ChronoDuration::days(user.privacy.retention_days as i64);
            let removed =
                self.store.with_conn(|conn| messages::delete_older_than(conn, &user.id, cutoff))?;
            if removed > 0 {
                info!("[scheduler] Purged {} messages for user {}", removed, user.id);
            }
        }
        Ok(())
    }
}

/// Sleep until `deadline`, polling the stop flag. Returns false when
/// stopped early.
async fn sleep_until(deadline: DateTime<Utc>, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline - Utc::now();
        if remaining <= ChronoDuration::zero() {
            return true;
        }
        let chunk = remaining
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .min(Duration::from_secs(1));
        tokio::time::sleep(chunk).await;
    }
}

/// Sleep `duration` in stop-aware chunks. Returns false when stopped.
async fn sleep_for(duration: Duration, stop: &AtomicBool) -> bool {
    sleep_until(Utc::now() + ChronoDuration::from_std(duration).unwrap_or_default(), stop).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{
        RefundMethod, RefundReceipt, SubscriptionPlan, SubscriptionStatus, User, UserSubscription,
    };
    use crate::engine::cache::MemoryCache;
    use crate::engine::gateway::PaymentGateway;
    use crate::engine::metrics::Metrics;
    use crate::engine::repos::cached::CachedPlans;
    use crate::engine::repos::plans as plans_repo;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::str::FromStr;
    use std::time::Duration as StdDuration;

    struct NoGateway;

    #[async_trait]
    impl PaymentGateway for NoGateway {
        fn name(&self) -> &str {
            "zarinpal"
        }
        async fn request_payment(
            &self,
            _a: i64,
            _d: &str,
            _c: &str,
            _m: &Value,
        ) -> EngineResult<(String, String)> {
            unimplemented!("not exercised")
        }
        async fn verify_payment(&self, _a: &str, _e: i64) -> EngineResult<String> {
            unimplemented!("not exercised")
        }
        async fn refund_payment(
            &self,
            _s: &str,
            _a: i64,
            _d: &str,
            _m: RefundMethod,
            _r: &str,
        ) -> EngineResult<RefundReceipt> {
            unimplemented!("not exercised")
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send_message(&self, message: OutboundMessage) -> EngineResult<()> {
            self.sent.lock().push(message);
            Ok(())
        }
        async fn set_menu_commands(&self, _c: i64, _a: bool) -> EngineResult<()> {
            Ok(())
        }
    }

    fn scheduler() -> (Arc<Store>, Arc<FakeMessenger>, Scheduler) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(MemoryCache::new());
        let plans =
            Arc::new(CachedPlans::new(store.clone(), cache, StdDuration::from_secs(60)));
        let messenger = Arc::new(FakeMessenger::default());
        let subscriptions = Arc::new(SubscriptionService::new(store.clone(), plans.clone()));
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            plans,
            Arc::new(NoGateway),
            messenger.clone(),
            Arc::new(Metrics::new()),
            "https://cb".into(),
        ));
        let sched = Scheduler::new(
            store.clone(),
            subscriptions,
            payments,
            messenger.clone(),
            Schedule::from_str("0 0 * * * *").unwrap(),
        );
        (store, messenger, sched)
    }

    #[tokio::test]
    async fn tick_sweeps_warns_once_and_purges() {
        let (store, messenger, sched) = scheduler();
        let now = Utc::now();

        let user = User::new(42, "Ada").unwrap();
        let mut warned_user = user.clone();
        warned_user.privacy.auto_delete = true;
        warned_user.privacy.retention_days = 7;
        let plan = SubscriptionPlan::new("basic", 30, 1_000, 500_000, vec![]).unwrap();

        // Active sub expiring in ~2 days (inside the 3-day window), plus
        // an old message past the 7-day retention.
        let mut sub = UserSubscription::new_active(&user.id, &plan, now);
        sub.expires_at = Some(now + ChronoDuration::days(2));
        let session = crate::atoms::types::ChatSession::new(&user.id, "gpt-4o-mini");
        let mut old_msg = crate::atoms::types::ChatMessage::new(
            &session.id,
            crate::atoms::types::ChatRole::User,
            "old".into(),
            1,
            false,
        );
        old_msg.created_at = now - ChronoDuration::days(10);

        store
            .with_conn(|conn| {
                users::insert(conn, &warned_user)?;
                plans_repo::insert(conn, &plan)?;
                subscriptions::insert(conn, &sub)?;
                crate::engine::repos::sessions::insert(conn, &session)?;
                messages::insert(conn, &old_msg)
            })
            .unwrap();

        sched.expiry_tick(now).await.unwrap();
        // One warning (threshold 3), old message purged.
        assert_eq!(messenger.sent.lock().len(), 1);
        assert!(messenger.sent.lock()[0].text.contains("expires in about 2 days"));
        assert_eq!(store.with_conn(messages::count_all).unwrap(), 0);

        // Same instant again: idempotent, nothing new.
        sched.expiry_tick(now).await.unwrap();
        assert_eq!(messenger.sent.lock().len(), 1);

        // A day before expiry the tighter threshold fires once more.
        let later = now + ChronoDuration::days(1) + ChronoDuration::hours(1);
        sched.expiry_tick(later).await.unwrap();
        assert_eq!(messenger.sent.lock().len(), 2);
        assert!(messenger.sent.lock()[1].text.contains("expires in about 1 day"));
    }

    #[tokio::test]
    async fn tick_promotes_reserved_after_expiry() {
        let (store, _messenger, sched) = scheduler();
        let now = Utc::now();
        let user = User::new(42, "Ada").unwrap();
        let plan = SubscriptionPlan::new("basic", 30, 1_000, 500_000, vec![]).unwrap();
        let mut active = UserSubscription::new_active(&user.id, &plan, now - ChronoDuration::days(31));
        active.expires_at = Some(now - ChronoDuration::days(1));
        let reserved =
            UserSubscription::new_reserved(&user.id, &plan, now - ChronoDuration::days(1));
        store
            .with_conn(|conn| {
                users::insert(conn, &user)?;
                plans_repo::insert(conn, &plan)?;
                subscriptions::insert(conn, &active)?;
                subscriptions::insert(conn, &reserved)
            })
            .unwrap();

        sched.expiry_tick(now).await.unwrap();
        let promoted = store
            .with_conn(|c| subscriptions::find_active_by_user(c, &user.id))
            .unwrap()
            .unwrap();
        assert_eq!(promoted.id, reserved.id);
        assert_eq!(promoted.status, SubscriptionStatus::Active);
    }
}
