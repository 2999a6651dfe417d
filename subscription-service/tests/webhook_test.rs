//! Razorpay webhooks.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Duration;
use common::{order_id, proof, today, user_token, TestApp, USER, WEBHOOK_SECRET};
use serde_json::{json, Value};
use rust_decimal::Decimal;
use subscription_service::models::{BillingCycle, Subscription, SubscriptionState};
use subscription_service::services::razorpay::compute_signature;
use subscription_service::services::PaymentStatus;

async fn deliver(app: &TestApp, event: Value, signature: Option<String>) -> (StatusCode, Value) {
    let body = event.to_string();
    let signature = signature.unwrap_or_else(|| compute_signature(&body, WEBHOOK_SECRET));
    let request = Request::post("/webhooks/razorpay")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", signature)
        .body(Body::from(body))
        .unwrap();
    app.send(request).await
}

fn payment_event(event: &str, payment_id: &str, order_id: &str, status: &str) -> Value {
    json!({
        "event": event,
        "payload": {
            "payment": { "entity": {
                "id": payment_id,
                "amount": 9900,
                "currency": "INR",
                "status": status,
                "order_id": order_id,
                "error_description": "Bank declined the payment"
            }}
        }
    })
}

async fn silver_checkout(app: &TestApp) -> String {
    let (status, checkout) = app
        .post(
            "/subscriptions/subscribe",
            &user_token(),
            json!({ "planName": "silver", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    order_id(&checkout)
}

#[tokio::test]
async fn forged_webhook_is_rejected() {
    let app = TestApp::spawn();
    let event = payment_event("payment.captured", "pay_1", "order_1", "captured");

    let (status, _) = deliver(&app, event, Some("forged".to_string())).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let app = TestApp::spawn();
    let request = Request::post("/webhooks/razorpay")
        .body(Body::from("{}"))
        .unwrap();

    let (status, _) = app.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn captured_payment_completes_checkout_once() {
    let app = TestApp::spawn();
    let token = user_token();
    let order = silver_checkout(&app).await;
    let (payment_id, signature) = app.gateway.pay_order(&order, PaymentStatus::Captured);

    let (status, body) = deliver(
        &app,
        payment_event("payment.captured", &payment_id, &order, "captured"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["outcome"], "applied");
    assert_eq!(app.entitlements(&token).await["subscriptionTier"], 1);

    // order.paid for the same payment arrives later.
    let (_, body) = deliver(
        &app,
        payment_event("order.paid", &payment_id, &order, "captured"),
        None,
    )
    .await;
    assert_eq!(body["data"]["outcome"], "ignored");

    // The client callback afterwards sees the settled attempt.
    let (status, body) = app
        .post(
            "/subscriptions/verify",
            &token,
            proof(&order, &payment_id, &signature),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["alreadyProcessed"], true);
    let entitlement = app.entitlements(&token).await;
    assert_eq!(entitlement["activeSubscriptions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_payment_closes_checkout() {
    let app = TestApp::spawn();
    let token = user_token();
    let order = silver_checkout(&app).await;
    let (payment_id, signature) = app.gateway.pay_order(&order, PaymentStatus::Failed);

    let (status, body) = deliver(
        &app,
        payment_event("payment.failed", &payment_id, &order, "failed"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "applied");

    let (status, body) = app
        .post(
            "/subscriptions/verify",
            &token,
            proof(&order, &payment_id, &signature),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["details"], "Bank declined the payment");
    assert_eq!(app.entitlements(&token).await["subscriptionTier"], 0);
}

#[tokio::test]
async fn unrelated_events_are_acknowledged() {
    let app = TestApp::spawn();

    let (status, body) = deliver(&app, json!({ "event": "refund.created", "payload": {} }), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "ignored");

    let (status, body) = deliver(
        &app,
        payment_event("payment.captured", "pay_x", "order_unknown", "captured"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "ignored");
}

fn subscription_event(event: &str, external_id: &str, charge: Option<(&str, u64)>) -> Value {
    let mut payload = json!({
        "subscription": { "entity": { "id": external_id, "status": "active" } }
    });
    if let Some((payment_id, amount)) = charge {
        payload["payment"] = json!({ "entity": {
            "id": payment_id,
            "amount": amount,
            "currency": "INR",
            "status": "captured",
            "order_id": null
        }});
    }
    json!({ "event": event, "payload": payload })
}

async fn seed_recurring(app: &TestApp, days_elapsed: i64) -> Subscription {
    app.seed_recurring(USER, "platinum", "sub_ext_9", days_elapsed)
        .await
}

#[tokio::test]
async fn subscription_charge_renews_once() {
    let app = TestApp::spawn();
    let sub = seed_recurring(&app, 29).await;
    assert_eq!(sub.expiry_date, today() + Duration::days(1));
    let event = subscription_event("subscription.charged", "sub_ext_9", Some(("pay_renew_1", 29_900)));

    let (status, body) = deliver(&app, event.clone(), None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["outcome"], "applied");

    let renewed = app.subscription(sub.subscription_id).await;
    assert_eq!(renewed.period_start, sub.expiry_date);
    assert_eq!(renewed.price_paid, Decimal::from(299));
    assert_eq!(renewed.expiry_date, sub.expiry_date + Duration::days(30));
    assert_eq!(renewed.last_payment_id.as_deref(), Some(("pay_renew_1", 29_900)));

    // Redelivery of the same charge.
    let (_, body) = deliver(&app, event, None).await;
    assert_eq!(body["data"]["outcome"], "ignored");
    assert_eq!(
        app.subscription(sub.subscription_id).await.expiry_date,
        renewed.expiry_date
    );
}

#[tokio::test]
async fn renewal_charge_applies_the_scheduled_downgrade() {
    let app = TestApp::spawn();
    let token = user_token();
    app.reprice("gold", BillingCycle::Monthly, 199, Some("plan_gold_m"))
        .await;
    let sub = seed_recurring(&app, 29).await;
    let (status, body) = app
        .post(
            "/subscriptions/downgrade",
            &token,
            json!({ "planName": "gold", "cycle": "monthly" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    // The provider bills the new plan from the renewal on.
    let (status, body) = deliver(
        &app,
        subscription_event("subscription.charged", "sub_ext_9", Some(("pay_renew_2", 19_900))),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["outcome"], "applied");

    let renewed = app.subscription(sub.subscription_id).await;
    assert_eq!(renewed.plan_name, "gold");
    assert_eq!(renewed.tier, 2);
    assert_eq!(renewed.state, SubscriptionState::Active);
    assert!(renewed.scheduled_change.is_none());
    assert!(renewed.auto_renew);
    assert_eq!(renewed.price_paid, Decimal::from(199));
    assert_eq!(renewed.period_start, sub.expiry_date);
    assert_eq!(app.entitlements(&token).await["subscriptionTier"], 2);
}

#[tokio::test]
async fn early_charge_is_not_a_renewal() {
    let app = TestApp::spawn();
    let sub = seed_recurring(&app, 2).await;

    let (_, body) = deliver(
        &app,
        subscription_event("subscription.charged", "sub_ext_9", Some(("pay_early", 29_900))),
        None,
    )
    .await;

    assert_eq!(body["data"]["outcome"], "ignored");
    assert_eq!(
        app.subscription(sub.subscription_id).await.expiry_date,
        sub.expiry_date
    );
}

#[tokio::test]
async fn provider_cancellation_stops_auto_renew() {
    let app = TestApp::spawn();
    let sub = seed_recurring(&app, 5).await;

    let (_, body) = deliver(
        &app,
        subscription_event("subscription.cancelled", "sub_ext_9", None),
        None,
    )
    .await;
    assert_eq!(body["data"]["outcome"], "applied");

    let cancelled = app.subscription(sub.subscription_id).await;
    assert_eq!(cancelled.state, SubscriptionState::CancelledPendingExpiry);
    assert!(!cancelled.auto_renew);
    assert_eq!(app.entitlements(&user_token()).await["subscriptionTier"], 3);
}
