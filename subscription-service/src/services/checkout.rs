//! Bridge between payment attempts and the payment provider.

use super::gateway::{PaymentGateway, PaymentStatus};
use crate::models::{BillingCycle, CheckoutHandle, HandleKind, PaymentAttempt, PaymentPurpose, Plan};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// What the client's checkout widget hands back after payment.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaymentProof {
    #[validate(length(min = 1, max = 64))]
    pub order_id: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub subscription_id: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub payment_id: String,
    #[validate(length(min = 1, max = 128))]
    pub signature: String,
}

impl PaymentProof {
    /// The checkout handle this proof refers to. Exactly one id must be set.
    pub fn handle(&self) -> Result<(HandleKind, &str), AppError> {
        match (self.order_id.as_deref(), self.subscription_id.as_deref()) {
            (Some(order_id), None) => Ok((HandleKind::Order, order_id)),
            (None, Some(subscription_id)) => Ok((HandleKind::Subscription, subscription_id)),
            _ => Err(AppError::BadRequest(anyhow::anyhow!(
                "Provide exactly one of orderId or subscriptionId"
            ))),
        }
    }
}

/// Result of checking a proof with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Captured { payment_id: String },
    Failed { reason: String },
    /// Authorized but not captured yet, or the provider could not be reached.
    Pending,
}

/// Convert rupees to paise. Amounts are whole rupees by construction.
pub fn to_minor_units(amount: Decimal) -> Result<u64, AppError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_u64()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Invalid charge amount {}", amount)))
}

/// Convert a provider amount in paise to rupees.
pub fn from_minor_units(amount: u64) -> Decimal {
    Decimal::from(amount) / Decimal::ONE_HUNDRED
}

/// Provider plan that bills `plan` on `cycle`.
pub fn recurring_plan_id(plan: &Plan, cycle: BillingCycle) -> Result<&str, AppError> {
    plan.price_for(cycle)
        .and_then(|p| p.external_price_id.as_deref())
        .ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "Plan '{}' cannot renew automatically on the {} cycle; cancel and subscribe to it after expiry",
                plan.name,
                cycle.as_str()
            ))
        })
}

pub struct CheckoutBridge {
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl CheckoutBridge {
    pub fn new(gateway: Arc<dyn PaymentGateway>, currency: String) -> Self {
        Self { gateway, currency }
    }

    pub fn key_id(&self) -> &str {
        self.gateway.key_id()
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Create the provider object the client pays against.
    ///
    /// New subscriptions on a cycle with a provider plan id become recurring
    /// provider subscriptions; everything else is a one-off order for
    /// `amount`.
    pub async fn initiate(
        &self,
        attempt_id: Uuid,
        user_id: &str,
        purpose: PaymentPurpose,
        plan: &Plan,
        cycle: BillingCycle,
        amount: Decimal,
    ) -> Result<CheckoutHandle, AppError> {
        let notes = serde_json::json!({
            "attempt_id": attempt_id.to_string(),
            "user_id": user_id,
            "purpose": purpose.as_str(),
            "plan": plan.name,
            "cycle": cycle.as_str(),
        });

        let recurring = plan
            .price_for(cycle)
            .and_then(|p| p.external_price_id.as_deref())
            .filter(|_| purpose == PaymentPurpose::NewSubscription);

        if let Some(provider_plan_id) = recurring {
            let subscription = self
                .gateway
                .create_subscription(provider_plan_id, cycle.default_total_count(), notes)
                .await?;
            return Ok(CheckoutHandle::Subscription {
                subscription_id: subscription.id,
            });
        }

        let receipt = attempt_id.simple().to_string();
        let order = self
            .gateway
            .create_order(to_minor_units(amount)?, &self.currency, &receipt, notes)
            .await?;
        Ok(CheckoutHandle::Order { order_id: order.id })
    }

    /// Check `proof` against `attempt` and the provider's view of the
    /// payment.
    pub async fn verify(&self, attempt: &PaymentAttempt, proof: &PaymentProof) -> Verdict {
        let signature_ok = match &attempt.handle {
            CheckoutHandle::Order { order_id } => {
                self.gateway
                    .verify_order_signature(order_id, &proof.payment_id, &proof.signature)
            }
            CheckoutHandle::Subscription { subscription_id } => self
                .gateway
                .verify_subscription_signature(subscription_id, &proof.payment_id, &proof.signature),
        };
        if !signature_ok {
            return Verdict::Failed {
                reason: "Payment signature verification failed".to_string(),
            };
        }

        self.check_payment(attempt, &proof.payment_id).await
    }

    /// Provider status of `payment_id` as a verdict for `attempt`.
    pub async fn check_payment(&self, attempt: &PaymentAttempt, payment_id: &str) -> Verdict {
        let payment = match self.gateway.fetch_payment(payment_id).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::warn!(
                    attempt_id = %attempt.attempt_id,
                    payment_id,
                    error = %e,
                    "Could not confirm payment with provider"
                );
                return Verdict::Pending;
            }
        };

        if let CheckoutHandle::Order { order_id } = &attempt.handle {
            if payment.order_id.as_deref() != Some(order_id.as_str()) {
                return Verdict::Failed {
                    reason: "Payment does not belong to this checkout".to_string(),
                };
            }
            if to_minor_units(attempt.amount).ok() != Some(payment.amount) {
                return Verdict::Failed {
                    reason: "Paid amount does not match the checkout amount".to_string(),
                };
            }
        }

        match payment.status {
            PaymentStatus::Captured => Verdict::Captured {
                payment_id: payment.id,
            },
            PaymentStatus::Failed | PaymentStatus::Refunded => Verdict::Failed {
                reason: payment
                    .error_description
                    .unwrap_or_else(|| "Payment was declined".to_string()),
            },
            PaymentStatus::Created | PaymentStatus::Authorized => Verdict::Pending,
        }
    }

    pub fn verify_webhook(&self, body: &str, signature: &str) -> bool {
        self.gateway.verify_webhook_signature(body, signature)
    }

    /// Bill `plan_id` from the next renewal of `subscription_id`, replacing
    /// a change scheduled earlier when `replaces_pending` is set.
    pub async fn schedule_recurring_change(
        &self,
        subscription_id: &str,
        plan_id: &str,
        replaces_pending: bool,
    ) -> Result<(), AppError> {
        if replaces_pending {
            self.gateway.cancel_scheduled_changes(subscription_id).await?;
        }
        Ok(self
            .gateway
            .schedule_plan_change(subscription_id, plan_id)
            .await?)
    }

    pub async fn revoke_recurring_change(&self, subscription_id: &str) -> Result<(), AppError> {
        Ok(self
            .gateway
            .cancel_scheduled_changes(subscription_id)
            .await?)
    }

    /// Stop provider renewals for `subscription_id`.
    pub async fn cancel_recurring(
        &self,
        subscription_id: &str,
        at_cycle_end: bool,
    ) -> Result<(), AppError> {
        Ok(self
            .gateway
            .cancel_subscription(subscription_id, at_cycle_end)
            .await?)
    }
}
