//! Plan catalog model.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tier of users without any paid subscription. Never stored in the catalog.
pub const FREE_TIER: i32 = 0;

/// Billing cycle offered by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    pub fn period_days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }

    /// End of a period of this cycle starting at `start`.
    pub fn period_end(&self, start: NaiveDate) -> NaiveDate {
        start
            .checked_add_signed(Duration::days(self.period_days()))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Number of charges requested when a recurring provider subscription is created.
    pub fn default_total_count(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 120,
            BillingCycle::Yearly => 10,
        }
    }
}

/// What a plan sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Subscription,
    StorageAddon,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Subscription => "subscription",
            PlanType::StorageAddon => "storage_addon",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "storage_addon" => PlanType::StorageAddon,
            _ => PlanType::Subscription,
        }
    }
}

/// Price of a plan for one billing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPrice {
    /// Price in whole currency units (rupees).
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Recurring plan id at the payment provider, when the cycle is sold as a
    /// provider-managed subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_price_id: Option<String>,
}

/// Feature flags unlocked by a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanFeatures {
    pub no_ads: bool,
    pub blue_tick: bool,
    pub gold_tick: bool,
    /// Multiplier applied to engagement ranking; 1 means no boost.
    #[serde(with = "rust_decimal::serde::float")]
    pub engagement_boost: Decimal,
    pub bio_links_limit: u32,
    pub caption_links_limit: u32,
    pub custom_theme: bool,
}

impl Default for PlanFeatures {
    /// What a free account gets.
    fn default() -> Self {
        Self {
            no_ads: false,
            blue_tick: false,
            gold_tick: false,
            engagement_boost: Decimal::ONE,
            bio_links_limit: 1,
            caption_links_limit: 0,
            custom_theme: false,
        }
    }
}

/// A subscription tier or storage add-on offered in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Identity. Admin upserts take it from the path.
    #[serde(default)]
    pub name: String,
    pub display_name: String,
    pub tier: i32,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    #[serde(default)]
    pub storage_gb: i32,
    pub pricing: BTreeMap<BillingCycle, PlanPrice>,
    #[serde(default)]
    pub features: PlanFeatures,
    #[serde(default)]
    pub is_best_value: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Plan {
    /// Price for `cycle`, or `None` when the plan is not sold on that cycle.
    pub fn price_for(&self, cycle: BillingCycle) -> Option<&PlanPrice> {
        self.pricing.get(&cycle)
    }

    pub fn is_subscription(&self) -> bool {
        self.plan_type == PlanType::Subscription
    }
}
