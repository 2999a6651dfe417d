//! Subscription operations: the catalog, entitlements, checkouts, plan
//! changes, verification, webhooks and rollover.

use super::checkout::{from_minor_units, recurring_plan_id, CheckoutBridge, PaymentProof, Verdict};
use super::metrics;
use super::razorpay::{parse_webhook_event, PaymentEntity};
use super::store::{AttemptSettlement, SubscriptionStore, SubscriptionWrite};
use crate::config::BillingSettings;
use crate::domain::{self, changes, RolloverAction};
use crate::models::{
    AttemptStatus, BillingCycle, CheckoutHandle, Entitlement, HandleKind, PaymentAttempt,
    PaymentPurpose, Plan, PlanType, ProrationPreview, Subscription, SubscriptionState,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Checkout details returned to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOutcome {
    pub attempt_id: Option<Uuid>,
    pub purpose: PaymentPurpose,
    pub plan_name: String,
    pub cycle: BillingCycle,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub key_id: String,
    /// Absent when nothing had to be paid.
    pub handle: Option<CheckoutHandle>,
    pub preview: ProrationPreview,
    /// The change was applied without a payment.
    pub completed: bool,
    /// The granted plan renews through the provider. Upgrades are paid once
    /// and end any renewal the previous plan had.
    pub renews: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub attempt_id: Uuid,
    pub purpose: PaymentPurpose,
    pub status: AttemptStatus,
    /// The proof had already been applied by an earlier call or webhook.
    pub already_processed: bool,
    pub entitlement: Entitlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloverReport {
    pub changes_applied: u64,
    pub expired: u64,
    pub attempts_abandoned: u64,
    /// Records that changed under the job and were left for the next run.
    pub skipped: u64,
}

fn not_found(what: &str, name: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} '{}' not found", what, name))
}

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    checkout: CheckoutBridge,
    billing: BillingSettings,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        checkout: CheckoutBridge,
        billing: BillingSettings,
    ) -> Self {
        Self {
            store,
            checkout,
            billing,
        }
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.store.health_check().await
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub async fn list_plans(&self, include_archived: bool) -> Result<Vec<Plan>, AppError> {
        let mut plans = self.store.list_plans(include_archived).await?;
        domain::sort_catalog(&mut plans);
        Ok(plans)
    }

    #[instrument(skip(self, plan), fields(plan = %plan.name))]
    pub async fn upsert_plan(&self, plan: Plan) -> Result<Plan, AppError> {
        let catalog = self.store.list_plans(true).await?;
        domain::validate_plan(&plan, &catalog)?;
        let saved = self.store.upsert_plan(&plan).await?;
        info!(tier = saved.tier, plan_type = saved.plan_type.as_str(), "Plan saved");
        Ok(saved)
    }

    /// Hide a plan from the catalog. Existing holders keep it until expiry.
    #[instrument(skip(self))]
    pub async fn archive_plan(&self, name: &str) -> Result<Plan, AppError> {
        let plan = self
            .store
            .set_plan_active(name, false)
            .await?
            .ok_or_else(|| not_found("Plan", name))?;
        info!(plan = %plan.name, "Plan archived");
        Ok(plan)
    }

    async fn active_plan(&self, name: &str) -> Result<Plan, AppError> {
        self.store
            .get_plan(name)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| not_found("Plan", name))
    }

    async fn priced(
        &self,
        name: &str,
        plan_type: PlanType,
        cycle: BillingCycle,
    ) -> Result<(Plan, Decimal), AppError> {
        let plan = self.active_plan(name).await?;
        if plan.plan_type != plan_type {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is a {} plan",
                plan.name,
                plan.plan_type.as_str()
            )));
        }
        changes::ensure_cycle(&plan, cycle)?;
        let price = plan.price_for(cycle).map(|p| p.price).unwrap_or_default();
        Ok((plan, price))
    }

    // =========================================================================
    // Entitlements
    // =========================================================================

    pub async fn entitlements(
        &self,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<Entitlement, AppError> {
        let records = self.store.list_user_subscriptions(user_id).await?;
        let plans = self.store.list_plans(true).await?;
        let storage_used = self.store.storage_used(user_id).await?;
        Ok(domain::resolve(
            &records,
            &plans,
            storage_used,
            self.billing.free_storage_gb,
            today,
        ))
    }

    pub async fn record_storage_usage(&self, user_id: &str, bytes: i64) -> Result<(), AppError> {
        if bytes < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Storage usage must not be negative"
            )));
        }
        self.store.set_storage_used(user_id, bytes).await?;
        info!(user_id, bytes, "Storage usage recorded");
        Ok(())
    }

    async fn current_subscription(
        &self,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<Option<Subscription>, AppError> {
        let records = self.store.list_user_subscriptions(user_id).await?;
        Ok(domain::current_subscription(&records, today).cloned())
    }

    /// Current subscription record in `state`, or a conflict naming what was
    /// expected.
    async fn subscription_in(
        &self,
        user_id: &str,
        today: NaiveDate,
        states: &[SubscriptionState],
    ) -> Result<Subscription, AppError> {
        let current = self
            .current_subscription(user_id, today)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active subscription")))?;
        if !states.contains(&current.state) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription is {}",
                current.state.as_str()
            )));
        }
        Ok(current)
    }

    // =========================================================================
    // Proration
    // =========================================================================

    /// Credit comes from what the current period was worth when granted, so
    /// later catalog price changes never inflate it.
    fn quote(
        current: Option<&Subscription>,
        target: &Plan,
        price: Decimal,
        today: NaiveDate,
    ) -> Result<ProrationPreview, AppError> {
        let Some(current) = current else {
            return Ok(domain::preview_new_subscription(price));
        };
        changes::ensure_upgrade(current, target)?;

        Ok(domain::preview_upgrade(
            current.price_paid,
            price,
            current.period_start,
            current.expiry_date,
            today,
        ))
    }

    #[instrument(skip(self))]
    pub async fn proration_preview(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
        today: NaiveDate,
    ) -> Result<ProrationPreview, AppError> {
        let (target, price) = self.priced(plan_name, PlanType::Subscription, cycle).await?;
        let current = self.current_subscription(user_id, today).await?;
        Self::quote(current.as_ref(), &target, price, today)
    }

    // =========================================================================
    // Checkouts
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn start_checkout(
        &self,
        user_id: &str,
        purpose: PaymentPurpose,
        plan: &Plan,
        cycle: BillingCycle,
        preview: ProrationPreview,
        subscription_id: Option<Uuid>,
        write: Option<SubscriptionWrite>,
    ) -> Result<CheckoutOutcome, AppError> {
        let attempt_id = Uuid::new_v4();
        let amount = preview.amount_to_pay;
        let handle = self
            .checkout
            .initiate(attempt_id, user_id, purpose, plan, cycle, amount)
            .await?;

        let now = Utc::now();
        let attempt = PaymentAttempt {
            attempt_id,
            user_id: user_id.to_string(),
            purpose,
            plan_name: plan.name.clone(),
            cycle,
            subscription_id,
            handle: handle.clone(),
            amount,
            proration_credit: preview.proration_credit,
            currency: self.checkout.currency().to_string(),
            status: AttemptStatus::Pending,
            payment_id: None,
            failure_reason: None,
            created_utc: now,
            updated_utc: now,
        };
        self.store.record_checkout(&attempt, write.as_ref()).await?;

        metrics::record_checkout(purpose.as_str(), handle.kind().as_str());
        info!(
            user_id,
            attempt_id = %attempt_id,
            purpose = purpose.as_str(),
            plan = %plan.name,
            cycle = cycle.as_str(),
            amount = %amount,
            "Checkout initiated"
        );

        Ok(CheckoutOutcome {
            attempt_id: Some(attempt_id),
            purpose,
            plan_name: plan.name.clone(),
            cycle,
            amount,
            currency: attempt.currency,
            key_id: self.checkout.key_id().to_string(),
            renews: handle.kind() == HandleKind::Subscription,
            handle: Some(handle),
            preview,
            completed: false,
        })
    }

    #[instrument(skip(self))]
    pub async fn subscribe(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
        today: NaiveDate,
    ) -> Result<CheckoutOutcome, AppError> {
        let (plan, price) = self.priced(plan_name, PlanType::Subscription, cycle).await?;
        if let Some(current) = self.current_subscription(user_id, today).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Already subscribed to '{}'; upgrade or downgrade instead",
                current.plan_name
            )));
        }

        let preview = domain::preview_new_subscription(price);
        self.start_checkout(
            user_id,
            PaymentPurpose::NewSubscription,
            &plan,
            cycle,
            preview,
            None,
            None,
        )
        .await
    }

    /// Immediate upgrade, paid by the prorated difference. Users without a
    /// subscription go through the new-subscription flow instead.
    #[instrument(skip(self))]
    pub async fn upgrade(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
        today: NaiveDate,
    ) -> Result<CheckoutOutcome, AppError> {
        let (target, price) = self.priced(plan_name, PlanType::Subscription, cycle).await?;
        let Some(current) = self.current_subscription(user_id, today).await? else {
            return self.subscribe(user_id, plan_name, cycle, today).await;
        };

        let preview = Self::quote(Some(&current), &target, price, today)?;
        let pending = changes::begin_upgrade(&current, &target)?;

        if preview.amount_to_pay.is_zero() {
            return self
                .upgrade_without_payment(&current, &target, cycle, preview, today)
                .await;
        }

        let write = SubscriptionWrite::Update {
            subscription: pending,
            expected_state: current.state,
        };
        let outcome = self
            .start_checkout(
                user_id,
                PaymentPurpose::Upgrade,
                &target,
                cycle,
                preview,
                Some(current.subscription_id),
                Some(write),
            )
            .await?;
        metrics::record_plan_change("upgrade_requested");
        Ok(outcome)
    }

    /// The remaining credit covers the new plan: switch right away.
    async fn upgrade_without_payment(
        &self,
        current: &Subscription,
        target: &Plan,
        cycle: BillingCycle,
        preview: ProrationPreview,
        today: NaiveDate,
    ) -> Result<CheckoutOutcome, AppError> {
        let upgraded = changes::complete_upgrade(
            &changes::begin_upgrade(current, target)?,
            target,
            cycle,
            preview.new_plan_price,
            today,
        )?;

        self.store
            .write_subscription(&SubscriptionWrite::Update {
                subscription: upgraded,
                expected_state: current.state,
            })
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!("Subscription changed; retry the request"))
            })?;
        self.stop_provider_renewal(current).await;

        metrics::record_plan_change("upgrade_credited");
        info!(
            user_id = %current.user_id,
            plan = %target.name,
            "Upgrade covered by proration credit"
        );

        Ok(CheckoutOutcome {
            attempt_id: None,
            purpose: PaymentPurpose::Upgrade,
            plan_name: target.name.clone(),
            cycle,
            amount: Decimal::ZERO,
            currency: self.checkout.currency().to_string(),
            key_id: self.checkout.key_id().to_string(),
            handle: None,
            preview,
            completed: true,
            renews: false,
        })
    }

    #[instrument(skip(self))]
    pub async fn purchase_storage_addon(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
    ) -> Result<CheckoutOutcome, AppError> {
        let (plan, price) = self.priced(plan_name, PlanType::StorageAddon, cycle).await?;
        let preview = domain::preview_new_subscription(price);
        self.start_checkout(
            user_id,
            PaymentPurpose::StorageAddon,
            &plan,
            cycle,
            preview,
            None,
            None,
        )
        .await
    }

    // =========================================================================
    // Scheduled changes
    // =========================================================================

    async fn save_change(
        &self,
        current: &Subscription,
        next: Subscription,
        kind: &str,
    ) -> Result<Subscription, AppError> {
        let saved = self
            .store
            .write_subscription(&SubscriptionWrite::Update {
                subscription: next,
                expected_state: current.state,
            })
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!("Subscription changed; retry the request"))
            })?;
        metrics::record_plan_change(kind);
        info!(
            user_id = %saved.user_id,
            subscription_id = %saved.subscription_id,
            state = saved.state.as_str(),
            kind,
            "Subscription updated"
        );
        Ok(saved)
    }

    /// Provider subscription that will bill the next period of `sub`.
    fn provider_renewal(sub: &Subscription) -> Option<&str> {
        sub.external_subscription_id
            .as_deref()
            .filter(|_| sub.auto_renew)
    }

    /// Schedule a lower tier, or a cycle switch, for the end of the period.
    /// Provider-renewed records move their provider plan at the same point.
    #[instrument(skip(self))]
    pub async fn downgrade(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
        today: NaiveDate,
    ) -> Result<Subscription, AppError> {
        let target = self.active_plan(plan_name).await?;
        if !target.is_subscription() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan '{}' is not a subscription plan",
                target.name
            )));
        }
        let current = self
            .current_subscription(user_id, today)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active subscription")))?;

        let next = changes::schedule_change(&current, &target, cycle)?;
        if let Some(external_id) = Self::provider_renewal(&current) {
            let plan_id = recurring_plan_id(&target, cycle)?;
            self.checkout
                .schedule_recurring_change(
                    external_id,
                    plan_id,
                    current.scheduled_change.is_some(),
                )
                .await?;
        }
        self.save_change(&current, next, "downgrade_scheduled").await
    }

    #[instrument(skip(self))]
    pub async fn revoke_scheduled_change(
        &self,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<Subscription, AppError> {
        let current = self
            .subscription_in(user_id, today, &[SubscriptionState::ScheduledDowngrade])
            .await?;
        let next = changes::revoke_change(&current)?;
        if let Some(external_id) = Self::provider_renewal(&current) {
            self.checkout.revoke_recurring_change(external_id).await?;
        }
        self.save_change(&current, next, "change_revoked").await
    }

    /// Stop renewal; the plan stays usable until its expiry date.
    #[instrument(skip(self))]
    pub async fn cancel(&self, user_id: &str, today: NaiveDate) -> Result<Subscription, AppError> {
        let current = self
            .current_subscription(user_id, today)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No active subscription")))?;
        let next = changes::cancel(&current)?;

        if let Some(external_id) = current.external_subscription_id.as_deref() {
            self.checkout.cancel_recurring(external_id, true).await?;
        }
        self.save_change(&current, next, "cancelled").await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, user_id: &str, today: NaiveDate) -> Result<Subscription, AppError> {
        let current = self
            .subscription_in(user_id, today, &[SubscriptionState::CancelledPendingExpiry])
            .await?;
        if current.external_subscription_id.is_some() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Renewal was cancelled with the payment provider; subscribe again after expiry"
            )));
        }
        let next = changes::resume(&current, today)?;
        self.save_change(&current, next, "resumed").await
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    async fn plan_any(&self, name: &str) -> Result<Plan, AppError> {
        self.store
            .get_plan(name)
            .await?
            .ok_or_else(|| not_found("Plan", name))
    }

    async fn attempt_subscription(
        &self,
        attempt: &PaymentAttempt,
    ) -> Result<Option<Subscription>, AppError> {
        match attempt.subscription_id {
            Some(id) => self.store.get_subscription(id).await,
            None => Ok(None),
        }
    }

    /// Subscription write that grants what `attempt` paid for.
    async fn grant_for(
        &self,
        attempt: &PaymentAttempt,
        payment_id: &str,
        today: NaiveDate,
    ) -> Result<SubscriptionWrite, AppError> {
        let plan = self.plan_any(&attempt.plan_name).await?;

        if attempt.purpose == PaymentPurpose::Upgrade {
            let current = self.attempt_subscription(attempt).await?.ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Upgrade attempt {} has no subscription",
                    attempt.attempt_id
                ))
            })?;
            let mut upgraded = changes::complete_upgrade(
                &current,
                &plan,
                attempt.cycle,
                attempt.amount + attempt.proration_credit,
                today,
            )?;
            upgraded.last_payment_id = Some(payment_id.to_string());
            return Ok(SubscriptionWrite::Update {
                subscription: upgraded,
                expected_state: SubscriptionState::PendingUpgradePayment,
            });
        }

        let now = Utc::now();
        let external_subscription_id = match &attempt.handle {
            CheckoutHandle::Subscription { subscription_id } => Some(subscription_id.clone()),
            CheckoutHandle::Order { .. } => None,
        };
        Ok(SubscriptionWrite::Insert(Subscription {
            subscription_id: Uuid::new_v4(),
            user_id: attempt.user_id.clone(),
            plan_name: plan.name.clone(),
            plan_type: plan.plan_type,
            tier: plan.tier,
            cycle: attempt.cycle,
            price_paid: attempt.amount,
            state: SubscriptionState::Active,
            auto_renew: external_subscription_id.is_some(),
            period_start: today,
            expiry_date: attempt.cycle.period_end(today),
            scheduled_change: None,
            external_subscription_id,
            last_payment_id: Some(payment_id.to_string()),
            created_utc: now,
            updated_utc: now,
        }))
    }

    /// Subscription write that undoes what starting `attempt` changed.
    async fn release_for(
        &self,
        attempt: &PaymentAttempt,
    ) -> Result<Option<SubscriptionWrite>, AppError> {
        let Some(current) = self.attempt_subscription(attempt).await? else {
            return Ok(None);
        };
        if current.state != SubscriptionState::PendingUpgradePayment {
            return Ok(None);
        }
        Ok(Some(SubscriptionWrite::Update {
            subscription: changes::abort_upgrade(&current)?,
            expected_state: SubscriptionState::PendingUpgradePayment,
        }))
    }

    async fn stop_provider_renewal(&self, previous: &Subscription) {
        if let Some(external_id) = previous.external_subscription_id.as_deref() {
            if let Err(e) = self.checkout.cancel_recurring(external_id, false).await {
                warn!(
                    subscription_id = %previous.subscription_id,
                    external_subscription_id = external_id,
                    error = %e,
                    "Failed to cancel superseded provider subscription"
                );
            }
        }
    }

    /// Record `verdict` on a pending attempt. Returns the settled attempt, or
    /// `None` when it was already settled elsewhere or is still pending.
    async fn settle(
        &self,
        attempt: &PaymentAttempt,
        verdict: &Verdict,
        today: NaiveDate,
    ) -> Result<Option<PaymentAttempt>, AppError> {
        let (settlement, write) = match verdict {
            Verdict::Pending => return Ok(None),
            Verdict::Captured { payment_id } => (
                AttemptSettlement {
                    status: AttemptStatus::Verified,
                    payment_id: Some(payment_id.clone()),
                    failure_reason: None,
                },
                Some(self.grant_for(attempt, payment_id, today).await?),
            ),
            Verdict::Failed { reason } => (
                AttemptSettlement {
                    status: AttemptStatus::Failed,
                    payment_id: None,
                    failure_reason: Some(reason.clone()),
                },
                self.release_for(attempt).await?,
            ),
        };

        let upgraded_from = match (&write, attempt.purpose) {
            (Some(SubscriptionWrite::Update { .. }), PaymentPurpose::Upgrade)
                if settlement.status == AttemptStatus::Verified =>
            {
                self.attempt_subscription(attempt).await?
            }
            _ => None,
        };

        let settled = self
            .store
            .settle_attempt(attempt.attempt_id, &settlement, write.as_ref())
            .await?;

        if let Some(settled) = &settled {
            metrics::record_verification(settled.purpose.as_str(), settled.status.as_str());
            info!(
                user_id = %settled.user_id,
                attempt_id = %settled.attempt_id,
                purpose = settled.purpose.as_str(),
                status = settled.status.as_str(),
                reason = settled.failure_reason.as_deref().unwrap_or(""),
                "Payment attempt settled"
            );
            if let Some(previous) = upgraded_from {
                self.stop_provider_renewal(&previous).await;
            }
        }
        Ok(settled)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    async fn verification_outcome(
        &self,
        attempt: &PaymentAttempt,
        already_processed: bool,
        today: NaiveDate,
    ) -> Result<VerificationOutcome, AppError> {
        Ok(VerificationOutcome {
            attempt_id: attempt.attempt_id,
            purpose: attempt.purpose,
            status: attempt.status,
            already_processed,
            entitlement: self.entitlements(&attempt.user_id, today).await?,
        })
    }

    fn terminal_failure(attempt: &PaymentAttempt) -> AppError {
        let reason = attempt.failure_reason.clone().unwrap_or_else(|| match attempt.status {
            AttemptStatus::Abandoned => "Checkout expired; start a new one".to_string(),
            _ => "Payment failed".to_string(),
        });
        AppError::PaymentFailed(reason)
    }

    /// Verify a checkout callback and apply what was paid for, exactly once.
    ///
    /// Repeating a proof returns the first result without granting again.
    #[instrument(skip(self, proof), fields(payment_id = %proof.payment_id))]
    pub async fn verify(
        &self,
        user_id: &str,
        proof: &PaymentProof,
        expected_purpose: Option<PaymentPurpose>,
        today: NaiveDate,
    ) -> Result<VerificationOutcome, AppError> {
        let (kind, reference) = proof.handle()?;
        let attempt = self
            .store
            .get_attempt_by_handle(kind, reference)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| not_found("Checkout", reference))?;

        if let Some(expected) = expected_purpose {
            if attempt.purpose != expected {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Checkout '{}' is not an {} checkout",
                    reference,
                    expected.as_str()
                )));
            }
        }

        match attempt.status {
            AttemptStatus::Verified => {
                metrics::record_verification(attempt.purpose.as_str(), "duplicate");
                return self.verification_outcome(&attempt, true, today).await;
            }
            AttemptStatus::Failed | AttemptStatus::Abandoned => {
                return Err(Self::terminal_failure(&attempt));
            }
            AttemptStatus::Pending => {}
        }

        let verdict = self.checkout.verify(&attempt, proof).await;
        if verdict == Verdict::Pending {
            metrics::record_verification(attempt.purpose.as_str(), "pending");
            info!(attempt_id = %attempt.attempt_id, "Payment not captured yet");
            return Err(AppError::VerificationPending);
        }

        if let Some(settled) = self.settle(&attempt, &verdict, today).await? {
            return match settled.status {
                AttemptStatus::Verified => self.verification_outcome(&settled, false, today).await,
                _ => Err(Self::terminal_failure(&settled)),
            };
        }

        // Settled concurrently (second request or webhook); report that result.
        let latest = self
            .store
            .get_attempt_by_handle(kind, reference)
            .await?
            .ok_or_else(|| not_found("Checkout", reference))?;
        match latest.status {
            AttemptStatus::Verified => self.verification_outcome(&latest, true, today).await,
            AttemptStatus::Pending => Err(AppError::VerificationPending),
            _ => Err(Self::terminal_failure(&latest)),
        }
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Apply a provider webhook. Events that do not concern a known checkout
    /// are acknowledged and ignored.
    #[instrument(skip(self, body, signature))]
    pub async fn handle_webhook(
        &self,
        body: &str,
        signature: &str,
        today: NaiveDate,
    ) -> Result<WebhookOutcome, AppError> {
        if !self.checkout.verify_webhook(body, signature) {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid webhook signature"
            )));
        }
        let event = parse_webhook_event(body)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Malformed webhook: {}", e)))?;

        let payment = event.payload.payment.map(|p| p.entity);
        let subscription_id = event.payload.subscription.map(|s| s.entity.id);

        let outcome = match (event.event.as_str(), payment, subscription_id) {
            ("payment.captured" | "order.paid", Some(payment), _) => {
                self.webhook_order_payment(&payment, true, today).await?
            }
            ("payment.failed", Some(payment), _) => {
                self.webhook_order_payment(&payment, false, today).await?
            }
            ("subscription.activated" | "subscription.charged", Some(payment), Some(sub_id)) => {
                self.webhook_subscription_charge(&sub_id, &payment, today)
                    .await?
            }
            ("subscription.cancelled" | "subscription.halted" | "subscription.completed", _, Some(sub_id)) => {
                self.webhook_subscription_ended(&sub_id, today).await?
            }
            _ => WebhookOutcome::Ignored,
        };

        metrics::record_webhook_event(&event.event, outcome.as_str());
        info!(event = %event.event, outcome = outcome.as_str(), "Webhook processed");
        Ok(outcome)
    }

    async fn webhook_order_payment(
        &self,
        payment: &PaymentEntity,
        captured: bool,
        today: NaiveDate,
    ) -> Result<WebhookOutcome, AppError> {
        let Some(order_id) = payment.order_id.as_deref() else {
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(attempt) = self
            .store
            .get_attempt_by_handle(HandleKind::Order, order_id)
            .await?
            .filter(|a| a.status == AttemptStatus::Pending)
        else {
            return Ok(WebhookOutcome::Ignored);
        };

        // The webhook body is signed, but the provider remains the authority
        // on status and amount.
        let verdict = if captured {
            self.checkout.check_payment(&attempt, &payment.id).await
        } else {
            Verdict::Failed {
                reason: payment
                    .error_description
                    .clone()
                    .unwrap_or_else(|| "Payment was declined".to_string()),
            }
        };

        Ok(match self.settle(&attempt, &verdict, today).await? {
            Some(_) => WebhookOutcome::Applied,
            None => WebhookOutcome::Ignored,
        })
    }

    async fn webhook_subscription_charge(
        &self,
        external_id: &str,
        payment: &PaymentEntity,
        today: NaiveDate,
    ) -> Result<WebhookOutcome, AppError> {
        if let Some(attempt) = self
            .store
            .get_attempt_by_handle(HandleKind::Subscription, external_id)
            .await?
            .filter(|a| a.status == AttemptStatus::Pending)
        {
            let verdict = Verdict::Captured {
                payment_id: payment.id.clone(),
            };
            return Ok(match self.settle(&attempt, &verdict, today).await? {
                Some(_) => WebhookOutcome::Applied,
                None => WebhookOutcome::Ignored,
            });
        }

        // Renewal of a subscription granted earlier.
        let Some(current) = self.store.find_by_external_subscription(external_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        let renewable = matches!(
            current.state,
            SubscriptionState::Active | SubscriptionState::ScheduledDowngrade
        );
        if !renewable
            || current.last_payment_id.as_deref() == Some(payment.id.as_str())
            || !changes::renewal_due(&current, today, self.billing.renewal_grace_days)
        {
            return Ok(WebhookOutcome::Ignored);
        }

        let scheduled_plan = match current.scheduled_change.as_ref() {
            Some(change) => Some(self.plan_any(&change.new_plan_name).await?),
            None => None,
        };
        let renewed = changes::renew(
            &current,
            scheduled_plan.as_ref(),
            &payment.id,
            from_minor_units(payment.amount),
        )?;
        self.save_change(&current, renewed, "renewed").await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn webhook_subscription_ended(
        &self,
        external_id: &str,
        today: NaiveDate,
    ) -> Result<WebhookOutcome, AppError> {
        let Some(current) = self.store.find_by_external_subscription(external_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        if !current.grants_on(today)
            || !matches!(
                current.state,
                SubscriptionState::Active | SubscriptionState::ScheduledDowngrade
            )
        {
            return Ok(WebhookOutcome::Ignored);
        }
        let next = changes::cancel(&current)?;
        self.save_change(&current, next, "cancelled_by_provider").await?;
        Ok(WebhookOutcome::Applied)
    }

    // =========================================================================
    // Rollover
    // =========================================================================

    /// Abandon stale checkouts, apply due scheduled changes and expire what
    /// no longer renews.
    #[instrument(skip(self))]
    pub async fn rollover(
        &self,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RolloverReport, AppError> {
        let mut report = RolloverReport::default();

        let cutoff = now - Duration::minutes(self.billing.checkout_timeout_minutes);
        for attempt in self.store.list_stale_attempts(cutoff).await? {
            let settlement = AttemptSettlement {
                status: AttemptStatus::Abandoned,
                payment_id: None,
                failure_reason: Some("Checkout expired; start a new one".to_string()),
            };
            let write = self.release_for(&attempt).await?;
            match self
                .store
                .settle_attempt(attempt.attempt_id, &settlement, write.as_ref())
                .await
            {
                Ok(Some(_)) => report.attempts_abandoned += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(attempt_id = %attempt.attempt_id, error = %e, "Could not abandon attempt");
                    report.skipped += 1;
                }
            }
        }

        let plans: HashMap<String, Plan> = self
            .store
            .list_plans(true)
            .await?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        for sub in self.store.list_due_subscriptions(today).await? {
            let action = domain::rollover_action(&sub, today, self.billing.renewal_grace_days);
            let next = match action {
                RolloverAction::Keep => continue,
                RolloverAction::ApplyScheduledChange => {
                    let target = sub
                        .scheduled_change
                        .as_ref()
                        .and_then(|c| plans.get(&c.new_plan_name));
                    match target {
                        // Nothing is collected for a period started here.
                        Some(plan) => changes::apply_scheduled_change(&sub, plan, Decimal::ZERO)?,
                        None => {
                            warn!(subscription_id = %sub.subscription_id, "Scheduled plan missing; expiring");
                            changes::expire(&sub)?
                        }
                    }
                }
                RolloverAction::Expire => changes::expire(&sub)?,
            };

            let write = SubscriptionWrite::Update {
                expected_state: sub.state,
                subscription: next,
            };
            match self.store.write_subscription(&write).await? {
                Some(saved) if saved.state == SubscriptionState::Expired => report.expired += 1,
                Some(_) => report.changes_applied += 1,
                None => report.skipped += 1,
            }
        }

        metrics::record_rollover_action("change_applied", report.changes_applied);
        metrics::record_rollover_action("expired", report.expired);
        metrics::record_rollover_action("attempt_abandoned", report.attempts_abandoned);
        info!(
            changes_applied = report.changes_applied,
            expired = report.expired,
            attempts_abandoned = report.attempts_abandoned,
            skipped = report.skipped,
            "Rollover completed"
        );

        Ok(report)
    }
}
