// ── Chatvend Engine: Payment Use-Case ──────────────────────────────────────
// The state machine lives here: initiated → pending on gateway accept,
// pending → succeeded/failed on verification. `confirm_auto` is safe to
// call any number of times for the same authority — duplicate callbacks,
// the reconciler and racing workers all funnel through
// `update_status_if_pending`, and only the winner grants.

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use std::sync::Arc;

use crate::atoms::constants::{RECONCILE_BATCH_LIMIT, RECONCILE_PENDING_CUTOFF_MINS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ActivationCode, OutboundMessage, Payment, PaymentStatus, Purchase, UserSubscription,
};
use crate::engine::gateway::PaymentGateway;
use crate::engine::messenger::Messenger;
use crate::engine::metrics::Metrics;
use crate::engine::repos::cached::CachedPlans;
use crate::engine::repos::{codes, payments, plans, purchases, users};
use crate::engine::store::Store;
use crate::engine::usecase::subscription::grant_in_tx;

pub struct PaymentService {
    store: Arc<Store>,
    plans: Arc<CachedPlans>,
    gateway: Arc<dyn PaymentGateway>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<Metrics>,
    callback_url: String,
}

impl PaymentService {
    pub fn new(
        store: Arc<Store>,
        plans: Arc<CachedPlans>,
        gateway: Arc<dyn PaymentGateway>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<Metrics>,
        callback_url: String,
    ) -> Self {
        PaymentService { store, plans, gateway, messenger, metrics, callback_url }
    }

    /// Start a purchase: create the intent, open it at the gateway, stamp
    /// the authority. Returns the payment and the redirect URL the user
    /// follows. Rejected when the user already holds a reserved
    /// subscription for a different plan.
    pub async fn request_payment(
        &self,
        user: &crate::atoms::types::User,
        plan_id: &str,
    ) -> EngineResult<(Payment, String)> {
        let plan = self.plans.find_by_id(plan_id).await?.ok_or(EngineError::NotFound("plan"))?;

        let reserved = self
            .store
            .with_conn(|conn| crate::engine::repos::subscriptions::list_reserved_by_user(conn, &user.id))?;
        if reserved.iter().any(|s| s.plan_id != plan.id) {
            return Err(EngineError::AlreadyHasReserved);
        }

        let payment = Payment::new_initiated(
            &user.id,
            &plan,
            self.gateway.name(),
            &self.callback_url,
            format!("Chatvend: {} plan", plan.name),
        );
        self.store.with_conn(|conn| payments::insert(conn, &payment))?;

        let (authority, pay_url) = self
            .gateway
            .request_payment(
                payment.amount_irr,
                &payment.description,
                &payment.callback_url,
                &payment.metadata,
            )
            .await?;

        let now = Utc::now();
        if !self.store.with_conn(|conn| payments::mark_pending(conn, &payment.id, &authority, now))? {
            return Err(EngineError::OperationFailed(format!(
                "payment {} left the initiated state unexpectedly",
                payment.id
            )));
        }

        let payment = self.reload(&payment.id)?;
        info!("[payment] {} pending for user {} plan {}", payment.id, user.id, plan.name);
        Ok((payment, pay_url))
    }

    /// Resolve a payment by gateway authority. Idempotent: terminal
    /// payments are returned as stored; otherwise the gateway verdict is
    /// applied atomically together with the grant and the purchase row.
    pub async fn confirm_auto(&self, authority: &str) -> EngineResult<Payment> {
        let payment = self
            .store
            .with_conn(|conn| payments::find_by_authority(conn, self.gateway.name(), authority))?
            .ok_or(EngineError::NotFound("payment"))?;
        if payment.status.is_terminal() {
            return Ok(payment);
        }

        match self.gateway.verify_payment(authority, payment.amount_irr).await {
            Ok(ref_id) => {
                let now = Utc::now();
                let granted: Option<UserSubscription> = self.store.with_tx(|tx| {
                    if !payments::update_status_if_pending(
                        tx,
                        &payment.id,
                        PaymentStatus::Succeeded,
                        Some(ref_id.as_str()),
                        now,
                    )? {
                        // Another worker resolved it between our read and
                        // this write; the stored state wins.
                        return Ok(None);
                    }
                    let plan = plans::find_by_id(tx, &payment.plan_id)?
                        .ok_or(EngineError::NotFound("plan"))?;
                    let sub = grant_in_tx(tx, &payment.user_id, &plan, now)?;
                    payments::set_subscription(tx, &payment.id, &sub.id)?;
                    purchases::insert(
                        tx,
                        &Purchase::new(&payment.user_id, &payment.plan_id, &payment.id, &sub.id),
                    )?;
                    Ok(Some(sub))
                })?;

                if let Some(sub) = granted {
                    Metrics::incr(&self.metrics.payments_succeeded);
                    info!(
                        "[payment] {} succeeded (ref {}), subscription {}",
                        payment.id, ref_id, sub.id
                    );
                    self.notify_granted(&payment, &sub).await;
                }
                self.reload(&payment.id)
            }
            Err(e @ EngineError::Gateway { .. }) => {
                // A definitive gateway verdict: the payment failed.
                let now = Utc::now();
                let flipped = self.store.with_tx(|tx| {
                    payments::update_status_if_pending(tx, &payment.id, PaymentStatus::Failed, None, now)
                })?;
                if flipped {
                    Metrics::incr(&self.metrics.payments_failed);
                    warn!("[payment] {} failed verification: {}", payment.id, e);
                }
                self.reload(&payment.id)
            }
            // Network trouble is not a verdict; leave pending for the
            // reconciler.
            Err(e) => Err(e),
        }
    }

    /// Issue a standalone activation code for a plan (admin flow).
    pub async fn issue_activation_code(
        &self,
        plan_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<ActivationCode> {
        let plan =
            self.plans.find_by_id(plan_id).await?.ok_or(EngineError::NotFound("plan"))?;
        let code = ActivationCode::new(&plan.id, expires_at);
        self.store.with_conn(|conn| codes::insert(conn, &code))?;
        info!("[payment] Activation code issued for plan {}", plan.name);
        Ok(code)
    }

    /// Attach a code to a manually-arranged payment.
    pub fn set_activation_code(
        &self,
        payment_id: &str,
        code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let updated = self
            .store
            .with_conn(|conn| payments::set_activation_code(conn, payment_id, code, expires_at))?;
        if !updated {
            return Err(EngineError::OperationFailed(format!(
                "payment {} is not open for an activation code",
                payment_id
            )));
        }
        Ok(())
    }

    /// Manual settlement path: mint a code for the plan of an open
    /// payment and attach it, so the payer can redeem out of band.
    pub async fn issue_code_for_payment(
        &self,
        payment_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<ActivationCode> {
        let payment = self
            .store
            .with_conn(|conn| payments::find_by_id(conn, payment_id))?
            .ok_or(EngineError::NotFound("payment"))?;
        if payment.status.is_terminal() {
            return Err(EngineError::OperationFailed(format!(
                "payment {} is not open for an activation code",
                payment.id
            )));
        }
        let code = self.issue_activation_code(&payment.plan_id, expires_at).await?;
        self.set_activation_code(&payment.id, &code.code, expires_at)?;
        Ok(code)
    }

    /// Redeem a single-use code: consume it, record a synthetic succeeded
    /// payment, grant, and append the purchase — all in one transaction.
    /// Of two concurrent redeemers exactly one sees the conditional
    /// update succeed; the other gets NotFound.
    pub async fn redeem_activation_code(
        &self,
        user: &crate::atoms::types::User,
        code_str: &str,
    ) -> EngineResult<UserSubscription> {
        let now = Utc::now();
        let (sub, payment) = self.store.with_tx(|tx| {
            let code = codes::find_by_code(tx, code_str)?
                .ok_or(EngineError::NotFound("activation code"))?;
            if !codes::redeem(tx, code_str, &user.id, now)? {
                return Err(EngineError::NotFound("activation code"));
            }
            let plan =
                plans::find_by_id(tx, &code.plan_id)?.ok_or(EngineError::NotFound("plan"))?;

            let mut payment =
                Payment::new_initiated(&user.id, &plan, "activation_code", "", "code redemption");
            payment.status = PaymentStatus::Succeeded;
            payment.ref_id = Some(code.code.clone());
            payment.paid_at = Some(now);
            payment.activation_code = Some(code.code.clone());
            payment.activation_expires_at = code.expires_at;
            payments::insert(tx, &payment)?;

            let sub = grant_in_tx(tx, &user.id, &plan, now)?;
            payments::set_subscription(tx, &payment.id, &sub.id)?;
            purchases::insert(tx, &Purchase::new(&user.id, &plan.id, &payment.id, &sub.id))?;
            Ok((sub, payment))
        })?;

        Metrics::incr(&self.metrics.payments_succeeded);
        info!("[payment] Code redeemed by user {}, subscription {}", user.id, sub.id);
        self.notify_granted(&payment, &sub).await;
        Ok(sub)
    }

    /// Re-verify stale pending payments; recovers from lost callbacks.
    /// Returns how many payments reached a terminal state.
    pub async fn reconcile_pending(&self) -> EngineResult<usize> {
        let stale = self.store.with_conn(|conn| {
            payments::list_pending_older_than(conn, RECONCILE_PENDING_CUTOFF_MINS, RECONCILE_BATCH_LIMIT)
        })?;
        let mut resolved = 0;
        for payment in stale {
            let authority = match &payment.authority {
                Some(a) => a.clone(),
                None => continue,
            };
            match self.confirm_auto(&authority).await {
                Ok(p) if p.status.is_terminal() => resolved += 1,
                Ok(_) => {}
                Err(e) => error!("[payment] Reconcile of {} failed: {}", payment.id, e),
            }
        }
        if resolved > 0 {
            info!("[payment] Reconciler resolved {} stale payments", resolved);
        }
        Ok(resolved)
    }

    fn reload(&self, payment_id: &str) -> EngineResult<Payment> {
        self.store
            .with_conn(|conn| payments::find_by_id(conn, payment_id))?
            .ok_or(EngineError::NotFound("payment"))
    }

    async fn notify_granted(&self, payment: &Payment, sub: &UserSubscription) {
        let user = match self.store.with_conn(|conn| users::find_by_id(conn, &payment.user_id)) {
            Ok(Some(u)) => u,
            _ => return,
        };
        let text = match sub.expires_at {
            Some(expires) => format!(
                "✅ Payment received! Your subscription is active until {}.",
                expires.format("%Y-%m-%d %H:%M UTC")
            ),
            None => match sub.scheduled_start_at {
                Some(start) => format!(
                    "✅ Payment received! Your subscription is reserved and starts {}.",
                    start.format("%Y-%m-%d %H:%M UTC")
                ),
                None => "✅ Payment received!".to_string(),
            },
        };
        if let Err(e) = self.messenger.send_message(OutboundMessage::text(user.tg_user_id, text)).await
        {
            warn!("[payment] Grant notification to {} failed: {}", user.tg_user_id, e);
        }
    }
}

/// Convenience for admin flows: expiry instant `days` from now.
pub fn expires_in_days(days: i64) -> DateTime<Utc> {
    Utc::now() + Duration::days(days)
}
