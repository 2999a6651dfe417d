//! Subscription records and their scheduled changes.

use super::{BillingCycle, PlanType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    PendingUpgradePayment,
    ScheduledDowngrade,
    CancelledPendingExpiry,
    Expired,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "active",
            SubscriptionState::PendingUpgradePayment => "pending_upgrade_payment",
            SubscriptionState::ScheduledDowngrade => "scheduled_downgrade",
            SubscriptionState::CancelledPendingExpiry => "cancelled_pending_expiry",
            SubscriptionState::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending_upgrade_payment" => SubscriptionState::PendingUpgradePayment,
            "scheduled_downgrade" => SubscriptionState::ScheduledDowngrade,
            "cancelled_pending_expiry" => SubscriptionState::CancelledPendingExpiry,
            "expired" => SubscriptionState::Expired,
            _ => SubscriptionState::Active,
        }
    }
}

/// Kind of change recorded for the next period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "upgrade",
            ChangeType::Downgrade => "downgrade",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "upgrade" => ChangeType::Upgrade,
            _ => ChangeType::Downgrade,
        }
    }
}

/// Plan change that takes effect when the current period ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledChange {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub new_plan_name: String,
    pub new_cycle: BillingCycle,
    pub effective_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub plan_name: String,
    pub plan_type: PlanType,
    /// Tier copied from the plan when the record was granted; 0 for add-ons.
    pub tier: i32,
    pub cycle: BillingCycle,
    /// Value of the current period when it was granted, proration credit
    /// included. Upgrade credit is prorated from this, never from the catalog.
    #[serde(with = "rust_decimal::serde::float")]
    pub price_paid: Decimal,
    pub state: SubscriptionState,
    pub auto_renew: bool,
    pub period_start: NaiveDate,
    /// First day on which the record no longer grants anything.
    pub expiry_date: NaiveDate,
    pub scheduled_change: Option<ScheduledChange>,
    /// Recurring subscription id at the payment provider, if any.
    pub external_subscription_id: Option<String>,
    /// Last provider payment applied to this record; renewals are matched on it.
    pub last_payment_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Whether this record contributes to entitlements on `today`.
    pub fn grants_on(&self, today: NaiveDate) -> bool {
        self.state != SubscriptionState::Expired && self.expiry_date > today
    }
}
