//! Read models returned to clients.

use super::{BillingCycle, PlanFeatures, PlanType, ScheduledChange, SubscriptionState};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Effective capabilities of a user on a given day.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub subscription_tier: i32,
    pub subscription_name: String,
    pub features: PlanFeatures,
    /// Free allowance plus plan and add-on storage, in GB.
    pub storage_gb: i64,
    pub storage_quota_bytes: i64,
    /// Measured usage in bytes, as reported by the content backend.
    pub storage_used: i64,
    /// Uploads are refused while usage exceeds the quota.
    pub storage_locked: bool,
    pub active_subscriptions: Vec<ActiveSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSubscription {
    pub subscription_id: Uuid,
    pub plan_name: String,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub cycle: BillingCycle,
    pub status: SubscriptionState,
    pub auto_renew: bool,
    pub expiry_date: NaiveDate,
    pub scheduled_change: Option<ScheduledChange>,
}

/// Quote for moving from the current plan to a higher tier now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProrationPreview {
    #[serde(with = "rust_decimal::serde::float")]
    pub new_plan_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub proration_credit: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_to_pay: Decimal,
    pub remaining_days: i64,
    pub total_days: i64,
    /// No current subscription: the charge is the full price.
    pub is_new_subscription: bool,
}
