//! Plan catalog invariants.

use crate::models::{BillingCycle, Plan, PlanType, FREE_TIER};
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("Plan name must be 1-64 characters of a-z, 0-9, '-' or '_'")]
    InvalidName,

    #[error("Display name is required")]
    MissingDisplayName,

    #[error("Subscription plans need a tier of at least 1, got {0}")]
    SubscriptionTier(i32),

    #[error("Storage add-ons must use tier 0")]
    AddonTier,

    #[error("Tier {tier} is already used by plan '{existing}'")]
    DuplicateTier { tier: i32, existing: String },

    #[error("At least one billing cycle must be priced")]
    NoPricing,

    #[error("Price for the {} cycle must not be negative", .0.as_str())]
    NegativePrice(BillingCycle),

    #[error("Storage must not be negative")]
    NegativeStorage,

    #[error("Engagement boost must be at least 1")]
    InvalidBoost,
}

impl From<CatalogError> for AppError {
    fn from(err: CatalogError) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Check `plan` on its own and against the rest of `catalog`.
///
/// An entry of `catalog` with the same name is the version being replaced and
/// is ignored. Archived plans do not reserve their tier.
pub fn validate_plan(plan: &Plan, catalog: &[Plan]) -> Result<(), CatalogError> {
    if !is_valid_name(&plan.name) {
        return Err(CatalogError::InvalidName);
    }
    if plan.display_name.trim().is_empty() {
        return Err(CatalogError::MissingDisplayName);
    }

    match plan.plan_type {
        PlanType::Subscription if plan.tier <= FREE_TIER => {
            return Err(CatalogError::SubscriptionTier(plan.tier));
        }
        PlanType::StorageAddon if plan.tier != FREE_TIER => return Err(CatalogError::AddonTier),
        _ => {}
    }

    if plan.pricing.is_empty() {
        return Err(CatalogError::NoPricing);
    }
    if let Some((cycle, _)) = plan
        .pricing
        .iter()
        .find(|(_, price)| price.price < Decimal::ZERO)
    {
        return Err(CatalogError::NegativePrice(*cycle));
    }
    if plan.storage_gb < 0 {
        return Err(CatalogError::NegativeStorage);
    }
    if plan.features.engagement_boost < Decimal::ONE {
        return Err(CatalogError::InvalidBoost);
    }

    if plan.plan_type == PlanType::Subscription && plan.is_active {
        if let Some(existing) = catalog.iter().find(|other| {
            other.name != plan.name
                && other.is_active
                && other.plan_type == PlanType::Subscription
                && other.tier == plan.tier
        }) {
            return Err(CatalogError::DuplicateTier {
                tier: plan.tier,
                existing: existing.name.clone(),
            });
        }
    }

    Ok(())
}

/// Subscription plans by tier, then add-ons by name.
pub fn sort_catalog(plans: &mut [Plan]) {
    plans.sort_by(|a, b| {
        let rank = |p: &Plan| match p.plan_type {
            PlanType::Subscription => 0,
            PlanType::StorageAddon => 1,
        };
        rank(a)
            .cmp(&rank(b))
            .then(a.tier.cmp(&b.tier))
            .then_with(|| a.name.cmp(&b.name))
    });
}
