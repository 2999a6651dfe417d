//! Scheduled downgrades, cancellation and the rollover job.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Duration;
use common::{admin_token, test_config, today, user_token, TestApp, USER};
use serde_json::json;
use subscription_service::models::{
    BillingCycle, ChangeType, ScheduledChange, SubscriptionState,
};

#[tokio::test]
async fn downgrade_is_scheduled_for_expiry_and_keeps_tier() {
    let app = TestApp::spawn();
    let token = user_token();
    let sub = app
        .seed_subscription(USER, "gold", BillingCycle::Monthly, 5)
        .await;

    let (status, body) = app
        .post(
            "/subscriptions/downgrade",
            &token,
            json!({ "planName": "silver", "cycle": "monthly" }),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["state"], "scheduled_downgrade");
    let change = &body["data"]["scheduledChange"];
    assert_eq!(change["type"], "downgrade");
    assert_eq!(change["newPlanName"], "silver");
    assert_eq!(change["effectiveDate"], sub.expiry_date.to_string());

    let entitlement = app.entitlements(&token).await;
    assert_eq!(entitlement["subscriptionTier"], 2);
    assert_eq!(
        entitlement["activeSubscriptions"][0]["scheduledChange"]["newPlanName"],
        "silver"
    );
}

#[tokio::test]
async fn switching_to_yearly_on_same_tier_is_scheduled_as_upgrade() {
    let app = TestApp::spawn();
    app.seed_subscription(USER, "gold", BillingCycle::Monthly, 5)
        .await;

    let (status, body) = app
        .post(
            "/subscriptions/downgrade",
            &user_token(),
            json!({ "planName": "gold", "cycle": "yearly" }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["scheduledChange"]["type"], "upgrade");
}

#[tokio::test]
async fn downgrade_to_higher_tier_or_same_plan_is_rejected() {
    let app = TestApp::spawn();
    let token = user_token();
    app.seed_subscription(USER, "silver", BillingCycle::Monthly, 5)
        .await;

    let (status, _) = app
        .post(
            "/subscriptions/downgrade",
            &token,
            json!({ "planName": "gold", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post(
            "/subscriptions/downgrade",
            &token,
            json!({ "planName": "silver", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scheduled_change_can_be_revoked() {
    let app = TestApp::spawn();
    let token = user_token();
    app.seed_subscription(USER, "gold", BillingCycle::Monthly, 5)
        .await;
    app.post(
        "/subscriptions/downgrade",
        &token,
        json!({ "planName": "silver", "cycle": "monthly" }),
    )
    .await;

    let (status, body) = app
        .request(Method::DELETE, "/subscriptions/scheduled-change", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "active");
    assert!(body["data"]["scheduledChange"].is_null());

    let (status, _) = app
        .request(Method::DELETE, "/subscriptions/scheduled-change", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn provider_renewed_downgrade_moves_the_provider_plan() {
    let app = TestApp::spawn();
    let token = user_token();
    app.reprice("gold", BillingCycle::Monthly, 199, Some("plan_gold_m"))
        .await;
    let sub = app.seed_recurring(USER, "platinum", "sub_ext_9", 5).await;

    let (status, body) = app
        .post(
            "/subscriptions/downgrade",
            &token,
            json!({ "planName": "gold", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(
        app.gateway.plan_changes(),
        vec![("sub_ext_9".to_string(), "plan_gold_m".to_string())]
    );
    assert!(app.gateway.reverted_changes().is_empty());

    let (status, body) = app
        .request(Method::DELETE, "/subscriptions/scheduled-change", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(app.gateway.reverted_changes(), vec!["sub_ext_9".to_string()]);

    let restored = app.subscription(sub.subscription_id).await;
    assert_eq!(restored.state, SubscriptionState::Active);
    assert_eq!(restored.plan_name, "platinum");
    assert!(restored.auto_renew);
}

#[tokio::test]
async fn provider_renewed_downgrade_needs_a_provider_plan() {
    let app = TestApp::spawn();
    let sub = app.seed_recurring(USER, "platinum", "sub_ext_9", 5).await;

    let (status, _) = app
        .post(
            "/subscriptions/downgrade",
            &user_token(),
            json!({ "planName": "silver", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(app.gateway.plan_changes().is_empty());
    let unchanged = app.subscription(sub.subscription_id).await;
    assert_eq!(unchanged.state, SubscriptionState::Active);
    assert!(unchanged.scheduled_change.is_none());
}

#[tokio::test]
async fn cancel_and_resume() {
    let app = TestApp::spawn();
    let token = user_token();
    app.seed_subscription(USER, "gold", BillingCycle::Monthly, 5)
        .await;

    let (status, body) = app
        .request(Method::POST, "/subscriptions/cancel", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "cancelled_pending_expiry");
    assert_eq!(body["data"]["autoRenew"], false);
    assert_eq!(app.entitlements(&token).await["subscriptionTier"], 2);

    let (status, body) = app
        .request(Method::POST, "/subscriptions/resume", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "active");

    let (status, _) = app
        .request(Method::POST, "/subscriptions/resume", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancelling_without_subscription_is_not_found() {
    let app = TestApp::spawn();

    let (status, _) = app
        .request(Method::POST, "/subscriptions/cancel", Some(&user_token()), None)
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelling_provider_subscription_stops_renewal_at_cycle_end() {
    let app = TestApp::spawn();
    let token = user_token();
    let mut sub = app
        .seed_subscription(USER, "platinum", BillingCycle::Monthly, 5)
        .await;
    sub.auto_renew = true;
    sub.external_subscription_id = Some("sub_ext_1".to_string());
    app.replace_subscription(sub, SubscriptionState::Active).await;

    let (status, _) = app
        .request(Method::POST, "/subscriptions/cancel", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.gateway.cancelled(), vec![("sub_ext_1".to_string(), true)]);

    // The provider side cannot be revived.
    let (status, _) = app
        .request(Method::POST, "/subscriptions/resume", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn rollover_applies_due_changes_and_expires_lapsed_records() {
    let app = TestApp::spawn();

    let mut due = app
        .seed_subscription(USER, "gold", BillingCycle::Monthly, 30)
        .await;
    assert_eq!(due.expiry_date, today());
    due.state = SubscriptionState::ScheduledDowngrade;
    due.scheduled_change = Some(ScheduledChange {
        change_type: ChangeType::Downgrade,
        new_plan_name: "silver".to_string(),
        new_cycle: BillingCycle::Yearly,
        effective_date: due.expiry_date,
    });
    app.replace_subscription(due.clone(), SubscriptionState::Active)
        .await;

    let lapsed = app
        .seed_subscription("user-2", "silver", BillingCycle::Monthly, 31)
        .await;
    let current = app
        .seed_subscription("user-3", "silver", BillingCycle::Monthly, 3)
        .await;

    let (status, body) = app
        .request(
            Method::POST,
            "/admin/subscriptions/rollover",
            Some(&admin_token()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["changesApplied"], 1);
    assert_eq!(body["data"]["expired"], 1);

    let switched = app.subscription(due.subscription_id).await;
    assert_eq!(switched.plan_name, "silver");
    assert_eq!(switched.tier, 1);
    assert_eq!(switched.cycle, BillingCycle::Yearly);
    assert_eq!(switched.state, SubscriptionState::Active);
    assert_eq!(switched.period_start, due.expiry_date);
    assert_eq!(switched.expiry_date, due.expiry_date + Duration::days(365));
    assert!(switched.scheduled_change.is_none());
    assert_eq!(app.entitlements(&user_token()).await["subscriptionTier"], 1);

    assert_eq!(
        app.subscription(lapsed.subscription_id).await.state,
        SubscriptionState::Expired
    );
    assert_eq!(
        app.subscription(current.subscription_id).await.state,
        SubscriptionState::Active
    );
}

#[tokio::test]
async fn rollover_leaves_provider_renewed_changes_to_the_renewal_charge() {
    let app = TestApp::spawn();
    let mut sub = app.seed_recurring(USER, "platinum", "sub_ext_9", 31).await;
    sub.state = SubscriptionState::ScheduledDowngrade;
    sub.scheduled_change = Some(ScheduledChange {
        change_type: ChangeType::Downgrade,
        new_plan_name: "gold".to_string(),
        new_cycle: BillingCycle::Monthly,
        effective_date: sub.expiry_date,
    });
    app.replace_subscription(sub.clone(), SubscriptionState::Active)
        .await;

    let (status, body) = app
        .request(
            Method::POST,
            "/admin/subscriptions/rollover",
            Some(&admin_token()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["changesApplied"], 0);
    assert_eq!(body["data"]["expired"], 0);

    let kept = app.subscription(sub.subscription_id).await;
    assert_eq!(kept.plan_name, "platinum");
    assert_eq!(kept.state, SubscriptionState::ScheduledDowngrade);
}

#[tokio::test]
async fn rollover_abandons_stale_checkouts() {
    let mut config = test_config();
    // Every pending checkout is already past the timeout.
    config.billing.checkout_timeout_minutes = -1;
    let app = TestApp::spawn_with(config);
    let token = user_token();
    let sub = app
        .seed_subscription(USER, "silver", BillingCycle::Monthly, 10)
        .await;
    let (status, _) = app
        .post(
            "/subscriptions/upgrade",
            &token,
            json!({ "planName": "gold", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .request(
            Method::POST,
            "/admin/subscriptions/rollover",
            Some(&admin_token()),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["attemptsAbandoned"], 1);
    assert_eq!(
        app.subscription(sub.subscription_id).await.state,
        SubscriptionState::Active
    );
}

#[tokio::test]
async fn rollover_is_admin_only() {
    let app = TestApp::spawn();

    let (status, _) = app
        .request(
            Method::POST,
            "/admin/subscriptions/rollover",
            Some(&user_token()),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}
