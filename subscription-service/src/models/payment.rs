//! Payment attempts and checkout handles.

use super::BillingCycle;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a payment attempt buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    NewSubscription,
    Upgrade,
    StorageAddon,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::NewSubscription => "new_subscription",
            PaymentPurpose::Upgrade => "upgrade",
            PaymentPurpose::StorageAddon => "storage_addon",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "upgrade" => PaymentPurpose::Upgrade,
            "storage_addon" => PaymentPurpose::StorageAddon,
            _ => PaymentPurpose::NewSubscription,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Verified,
    Failed,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Verified => "verified",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "verified" => AttemptStatus::Verified,
            "failed" => AttemptStatus::Failed,
            "abandoned" => AttemptStatus::Abandoned,
            _ => AttemptStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Order,
    Subscription,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Order => "order",
            HandleKind::Subscription => "subscription",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "subscription" => HandleKind::Subscription,
            _ => HandleKind::Order,
        }
    }
}

/// Provider object the client completes payment against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckoutHandle {
    Order {
        #[serde(rename = "orderId")]
        order_id: String,
    },
    Subscription {
        #[serde(rename = "subscriptionId")]
        subscription_id: String,
    },
}

impl CheckoutHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            CheckoutHandle::Order { .. } => HandleKind::Order,
            CheckoutHandle::Subscription { .. } => HandleKind::Subscription,
        }
    }

    pub fn provider_ref(&self) -> &str {
        match self {
            CheckoutHandle::Order { order_id } => order_id,
            CheckoutHandle::Subscription { subscription_id } => subscription_id,
        }
    }

    pub fn from_parts(kind: HandleKind, provider_ref: String) -> Self {
        match kind {
            HandleKind::Order => CheckoutHandle::Order {
                order_id: provider_ref,
            },
            HandleKind::Subscription => CheckoutHandle::Subscription {
                subscription_id: provider_ref,
            },
        }
    }
}

/// One initiated checkout, settled at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub user_id: String,
    pub purpose: PaymentPurpose,
    pub plan_name: String,
    pub cycle: BillingCycle,
    /// Subscription being upgraded; `None` for new subscriptions and add-ons.
    pub subscription_id: Option<Uuid>,
    pub handle: CheckoutHandle,
    /// Amount charged, in rupees.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub proration_credit: Decimal,
    pub currency: String,
    pub status: AttemptStatus,
    pub payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}
