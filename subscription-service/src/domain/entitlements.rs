use crate::models::{
    ActiveSubscription, Entitlement, Plan, PlanFeatures, PlanType, Subscription, FREE_TIER,
};
use chrono::NaiveDate;
use std::collections::HashMap;

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;
const FREE_PLAN_NAME: &str = "Free";

/// Highest-tier subscription record that grants on `today`.
pub fn current_subscription(records: &[Subscription], today: NaiveDate) -> Option<&Subscription> {
    records
        .iter()
        .filter(|s| s.plan_type == PlanType::Subscription && s.grants_on(today))
        .max_by(|a, b| a.tier.cmp(&b.tier).then(a.expiry_date.cmp(&b.expiry_date)))
}

/// Derive what a user may do on `today` from their records.
///
/// `plans` should include archived plans so existing holders keep their
/// features. Pending payments and scheduled changes never alter the tier:
/// only the record's current plan counts.
pub fn resolve(
    records: &[Subscription],
    plans: &[Plan],
    storage_used: i64,
    free_storage_gb: i64,
    today: NaiveDate,
) -> Entitlement {
    let by_name: HashMap<&str, &Plan> = plans.iter().map(|p| (p.name.as_str(), p)).collect();

    let current = current_subscription(records, today);
    let current_plan = current.and_then(|s| by_name.get(s.plan_name.as_str()).copied());

    let (tier, name, features, plan_storage) = match current {
        Some(sub) => (
            sub.tier,
            current_plan
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| sub.plan_name.clone()),
            current_plan.map(|p| p.features.clone()).unwrap_or_default(),
            current_plan.map(|p| i64::from(p.storage_gb)).unwrap_or(0),
        ),
        None => (
            FREE_TIER,
            FREE_PLAN_NAME.to_string(),
            PlanFeatures::default(),
            0,
        ),
    };

    let addon_storage: i64 = records
        .iter()
        .filter(|s| s.plan_type == PlanType::StorageAddon && s.grants_on(today))
        .filter_map(|s| by_name.get(s.plan_name.as_str()))
        .map(|p| i64::from(p.storage_gb))
        .sum();

    let storage_gb = free_storage_gb + plan_storage + addon_storage;
    let storage_quota_bytes = storage_gb.saturating_mul(BYTES_PER_GB);

    let mut active: Vec<&Subscription> = records.iter().filter(|s| s.grants_on(today)).collect();
    active.sort_by(|a, b| b.tier.cmp(&a.tier).then(a.expiry_date.cmp(&b.expiry_date)));

    Entitlement {
        subscription_tier: tier,
        subscription_name: name,
        features,
        storage_gb,
        storage_quota_bytes,
        storage_used,
        storage_locked: storage_used > storage_quota_bytes,
        active_subscriptions: active
            .into_iter()
            .map(|s| ActiveSubscription {
                subscription_id: s.subscription_id,
                plan_name: s.plan_name.clone(),
                plan_type: s.plan_type,
                cycle: s.cycle,
                status: s.state,
                auto_renew: s.auto_renew,
                expiry_date: s.expiry_date,
                scheduled_change: s.scheduled_change.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BillingCycle, ChangeType, PlanPrice, ScheduledChange, SubscriptionState,
    };
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 10).unwrap()
    }

    fn plan(name: &str, tier: i32, plan_type: PlanType, storage_gb: i32) -> Plan {
        let mut pricing = BTreeMap::new();
        pricing.insert(
            BillingCycle::Monthly,
            PlanPrice {
                price: Decimal::from(99),
                external_price_id: None,
            },
        );
        let mut features = PlanFeatures::default();
        features.gold_tick = tier >= 2;
        Plan {
            name: name.to_string(),
            display_name: format!("{name} plan"),
            tier,
            plan_type,
            storage_gb,
            pricing,
            features,
            is_best_value: false,
            is_active: true,
        }
    }

    fn record(plan: &Plan, state: SubscriptionState, expires_in: i64) -> Subscription {
        let now = Utc::now();
        Subscription {
            subscription_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            plan_name: plan.name.clone(),
            plan_type: plan.plan_type,
            tier: plan.tier,
            cycle: BillingCycle::Monthly,
            price_paid: Decimal::from(99),
            state,
            auto_renew: true,
            period_start: today() - Duration::days(10),
            expiry_date: today() + Duration::days(expires_in),
            scheduled_change: None,
            external_subscription_id: None,
            last_payment_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn catalog() -> Vec<Plan> {
        vec![
            plan("silver", 1, PlanType::Subscription, 10),
            plan("gold", 2, PlanType::Subscription, 50),
            plan("storage-20", 0, PlanType::StorageAddon, 20),
        ]
    }

    #[test]
    fn no_records_means_free() {
        let e = resolve(&[], &catalog(), 0, 1, today());
        assert_eq!(e.subscription_tier, 0);
        assert_eq!(e.subscription_name, "Free");
        assert_eq!(e.storage_gb, 1);
        assert!(e.active_subscriptions.is_empty());
        assert!(!e.storage_locked);
    }

    #[test]
    fn highest_granting_tier_wins() {
        let plans = catalog();
        let records = vec![
            record(&plans[0], SubscriptionState::Active, 20),
            record(&plans[1], SubscriptionState::CancelledPendingExpiry, 5),
        ];
        let e = resolve(&records, &plans, 0, 1, today());
        assert_eq!(e.subscription_tier, 2);
        assert_eq!(e.subscription_name, "gold plan");
        assert!(e.features.gold_tick);
        assert_eq!(e.storage_gb, 51);
        assert_eq!(e.active_subscriptions.len(), 2);
        assert_eq!(e.active_subscriptions[0].plan_name, "gold");
    }

    #[test]
    fn expired_records_grant_nothing() {
        let plans = catalog();
        let records = vec![
            record(&plans[1], SubscriptionState::Active, 0),
            record(&plans[0], SubscriptionState::Expired, 20),
        ];
        let e = resolve(&records, &plans, 0, 1, today());
        assert_eq!(e.subscription_tier, 0);
        assert!(e.active_subscriptions.is_empty());
    }

    #[test]
    fn scheduled_downgrade_keeps_current_tier() {
        let plans = catalog();
        let mut gold = record(&plans[1], SubscriptionState::ScheduledDowngrade, 20);
        gold.scheduled_change = Some(ScheduledChange {
            change_type: ChangeType::Downgrade,
            new_plan_name: "silver".to_string(),
            new_cycle: BillingCycle::Monthly,
            effective_date: gold.expiry_date,
        });
        let e = resolve(&[gold], &plans, 0, 1, today());
        assert_eq!(e.subscription_tier, 2);
        assert_eq!(
            e.active_subscriptions[0].scheduled_change.as_ref().unwrap().new_plan_name,
            "silver"
        );
    }

    #[test]
    fn addons_add_storage_and_lock_when_exceeded() {
        let plans = catalog();
        let records = vec![
            record(&plans[2], SubscriptionState::Active, 20),
            record(&plans[2], SubscriptionState::Active, 3),
        ];
        let e = resolve(&records, &plans, 0, 1, today());
        assert_eq!(e.subscription_tier, 0);
        assert_eq!(e.storage_gb, 41);

        let over = 42 * BYTES_PER_GB;
        let e = resolve(&records, &plans, over, 1, today());
        assert!(e.storage_locked);
        assert_eq!(e.storage_used, over);
    }
}
