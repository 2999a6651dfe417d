//! Test helpers for subscription-service integration tests.
//!
//! The real router runs against the in-memory store and a scripted gateway,
//! so no database or provider account is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::Value;
use service_core::auth::{Claims, TokenSettings};
use service_core::config::Config as CoreConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use subscription_service::config::{
    BillingSettings, DatabaseConfig, RateLimitConfig, RazorpayConfig, StoreBackend,
    SubscriptionConfig,
};
use subscription_service::models::{
    BillingCycle, Plan, PlanFeatures, PlanPrice, PlanType, Subscription, SubscriptionState,
};
use subscription_service::services::razorpay::compute_signature;
use subscription_service::services::{
    init_metrics, Database, GatewayError, MemoryStore, PaymentGateway, PaymentStatus, ProviderOrder,
    ProviderPayment, ProviderSubscription, SubscriptionStore, SubscriptionWrite,
};
use subscription_service::startup::{build_router, AppState};
use tower::ServiceExt;
use uuid::Uuid;

pub const ISSUER: &str = "https://securetoken.example.com/reelbox";
pub const AUDIENCE: &str = "reelbox";
pub const JWT_SECRET: &str = "integration-test-secret";
pub const KEY_SECRET: &str = "rzp_test_secret";
pub const WEBHOOK_SECRET: &str = "rzp_webhook_secret";
pub const USER: &str = "user-1";

// =============================================================================
// Fake gateway
// =============================================================================

/// Scripted payment provider. Orders are remembered with their amount; a test
/// then decides what the provider reports for the payment.
#[derive(Default)]
pub struct FakeGateway {
    counter: AtomicU32,
    orders: Mutex<HashMap<String, u64>>,
    payments: Mutex<HashMap<String, ProviderPayment>>,
    cancelled: Mutex<Vec<(String, bool)>>,
    plan_changes: Mutex<Vec<(String, String)>>,
    reverted_changes: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

impl FakeGateway {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Amount in paise of an order created through this gateway.
    pub fn order_amount(&self, order_id: &str) -> Option<u64> {
        self.orders.lock().unwrap().get(order_id).copied()
    }

    /// Register a payment for `order_id` and return `(payment_id, signature)`
    /// as the checkout widget would.
    pub fn pay_order(&self, order_id: &str, status: PaymentStatus) -> (String, String) {
        let amount = self.order_amount(order_id).unwrap_or(0);
        let payment_id = self.next_id("pay");
        self.payments.lock().unwrap().insert(
            payment_id.clone(),
            ProviderPayment {
                id: payment_id.clone(),
                status,
                order_id: Some(order_id.to_string()),
                amount,
                error_description: (status == PaymentStatus::Failed)
                    .then(|| "Card declined by issuer".to_string()),
            },
        );
        let signature = compute_signature(&format!("{}|{}", order_id, payment_id), KEY_SECRET);
        (payment_id, signature)
    }

    /// First payment of a provider subscription.
    pub fn pay_subscription(&self, subscription_id: &str) -> (String, String) {
        let payment_id = self.next_id("pay");
        self.payments.lock().unwrap().insert(
            payment_id.clone(),
            ProviderPayment {
                id: payment_id.clone(),
                status: PaymentStatus::Captured,
                order_id: None,
                amount: 0,
                error_description: None,
            },
        );
        let signature =
            compute_signature(&format!("{}|{}", payment_id, subscription_id), KEY_SECRET);
        (payment_id, signature)
    }

    pub fn set_payment_status(&self, payment_id: &str, status: PaymentStatus) {
        if let Some(payment) = self.payments.lock().unwrap().get_mut(payment_id) {
            payment.status = status;
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> Vec<(String, bool)> {
        self.cancelled.lock().unwrap().clone()
    }

    /// `(subscription_id, plan_id)` for every plan change scheduled.
    pub fn plan_changes(&self) -> Vec<(String, String)> {
        self.plan_changes.lock().unwrap().clone()
    }

    pub fn reverted_changes(&self) -> Vec<String> {
        self.reverted_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn key_id(&self) -> &str {
        "rzp_test_key"
    }

    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        _receipt: &str,
        _notes: Value,
    ) -> Result<ProviderOrder, GatewayError> {
        let id = self.next_id("order");
        self.orders.lock().unwrap().insert(id.clone(), amount);
        Ok(ProviderOrder {
            id,
            amount,
            currency: currency.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        _plan_id: &str,
        _total_count: u32,
        _notes: Value,
    ) -> Result<ProviderSubscription, GatewayError> {
        Ok(ProviderSubscription {
            id: self.next_id("sub"),
            status: "created".to_string(),
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_cycle_end: bool,
    ) -> Result<(), GatewayError> {
        self.cancelled
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), at_cycle_end));
        Ok(())
    }

    async fn schedule_plan_change(
        &self,
        subscription_id: &str,
        plan_id: &str,
    ) -> Result<(), GatewayError> {
        self.plan_changes
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), plan_id.to_string()));
        Ok(())
    }

    async fn cancel_scheduled_changes(&self, subscription_id: &str) -> Result<(), GatewayError> {
        self.reverted_changes
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConfigured);
        }
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "BAD_REQUEST_ERROR".to_string(),
                description: "The id provided does not exist".to_string(),
            })
    }

    fn verify_order_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        compute_signature(&format!("{}|{}", order_id, payment_id), KEY_SECRET) == signature
    }

    fn verify_subscription_signature(
        &self,
        subscription_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> bool {
        compute_signature(&format!("{}|{}", payment_id, subscription_id), KEY_SECRET) == signature
    }

    fn verify_webhook_signature(&self, body: &str, signature: &str) -> bool {
        compute_signature(body, WEBHOOK_SECRET) == signature
    }
}

// =============================================================================
// Catalog fixtures
// =============================================================================

fn price(amount: i64, external: Option<&str>) -> PlanPrice {
    PlanPrice {
        price: Decimal::from(amount),
        external_price_id: external.map(str::to_string),
    }
}

fn plan(name: &str, tier: i32, storage_gb: i32, pricing: Vec<(BillingCycle, PlanPrice)>) -> Plan {
    Plan {
        name: name.to_string(),
        display_name: name.to_uppercase(),
        tier,
        plan_type: PlanType::Subscription,
        storage_gb,
        pricing: pricing.into_iter().collect::<BTreeMap<_, _>>(),
        features: PlanFeatures::default(),
        is_best_value: false,
        is_active: true,
    }
}

/// silver (1, ₹99), gold (2, ₹199), platinum (3, ₹299 with a provider plan
/// id on monthly) and a 50 GB storage add-on (₹49).
pub fn catalog() -> Vec<Plan> {
    let mut silver = plan(
        "silver",
        1,
        10,
        vec![
            (BillingCycle::Monthly, price(99, None)),
            (BillingCycle::Yearly, price(999, None)),
        ],
    );
    silver.features.no_ads = true;

    let mut gold = plan(
        "gold",
        2,
        50,
        vec![
            (BillingCycle::Monthly, price(199, None)),
            (BillingCycle::Yearly, price(1999, None)),
        ],
    );
    gold.features.no_ads = true;
    gold.features.blue_tick = true;
    gold.is_best_value = true;

    let mut platinum = plan(
        "platinum",
        3,
        200,
        vec![(BillingCycle::Monthly, price(299, Some("plan_platinum_m")))],
    );
    platinum.features.gold_tick = true;

    let mut storage = plan(
        "storage-50",
        0,
        50,
        vec![(BillingCycle::Monthly, price(49, None))],
    );
    storage.plan_type = PlanType::StorageAddon;

    vec![silver, gold, platinum, storage]
}

// =============================================================================
// Test application
// =============================================================================

pub fn test_config() -> SubscriptionConfig {
    SubscriptionConfig {
        common: CoreConfig::default(),
        service_name: "subscription-service-test".to_string(),
        store: StoreBackend::Memory,
        database: DatabaseConfig {
            url: Secret::new(String::new()),
            max_connections: 1,
            min_connections: 1,
        },
        razorpay: RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: Secret::new(KEY_SECRET.to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            api_base_url: "http://localhost:0".to_string(),
        },
        auth: TokenSettings {
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            hmac_secret: Some(Secret::new(JWT_SECRET.to_string())),
            public_key_pem: None,
            leeway_seconds: 0,
        },
        billing: BillingSettings {
            currency: "INR".to_string(),
            free_storage_gb: 1,
            checkout_timeout_minutes: 30,
            renewal_grace_days: 3,
        },
        rate_limit: RateLimitConfig {
            checkout_attempts: 100,
            window_seconds: 60,
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(test_config())
    }

    pub fn spawn_with(config: SubscriptionConfig) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::with_plans(catalog()));
        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::new(config, store.clone(), gateway.clone())
            .expect("Failed to build test state");

        Self {
            router: build_router(state),
            store,
            gateway,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.request(Method::GET, path, token, None).await
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, path, Some(token), Some(body)).await
    }

    pub async fn entitlements(&self, token: &str) -> Value {
        let (status, body) = self.get("/subscriptions/entitlements", Some(token)).await;
        assert_eq!(status, StatusCode::OK, "entitlements: {}", body);
        body["data"].clone()
    }

    /// Seed a record for `user_id` whose current period started
    /// `days_elapsed` days ago.
    pub async fn seed_subscription(
        &self,
        user_id: &str,
        plan_name: &str,
        cycle: BillingCycle,
        days_elapsed: i64,
    ) -> Subscription {
        let subscription = subscription_fixture(user_id, plan_name, cycle, days_elapsed);
        self.store
            .write_subscription(&SubscriptionWrite::Insert(subscription))
            .await
            .unwrap()
            .unwrap()
    }

    /// Seed a record renewed by the provider under `external_id`.
    pub async fn seed_recurring(
        &self,
        user_id: &str,
        plan_name: &str,
        external_id: &str,
        days_elapsed: i64,
    ) -> Subscription {
        let mut sub = self
            .seed_subscription(user_id, plan_name, BillingCycle::Monthly, days_elapsed)
            .await;
        sub.auto_renew = true;
        sub.external_subscription_id = Some(external_id.to_string());
        sub.last_payment_id = Some("pay_first".to_string());
        self.replace_subscription(sub.clone(), SubscriptionState::Active)
            .await;
        sub
    }

    /// Replace a fixture plan's pricing on `cycle` through the store.
    pub async fn reprice(
        &self,
        plan_name: &str,
        cycle: BillingCycle,
        amount: i64,
        external: Option<&str>,
    ) {
        let mut plan = self
            .store
            .get_plan(plan_name)
            .await
            .unwrap()
            .expect("unknown fixture plan");
        plan.pricing.insert(cycle, price(amount, external));
        self.store.upsert_plan(&plan).await.unwrap();
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn replace_subscription(&self, subscription: Subscription, expected: SubscriptionState) {
        self.store
            .write_subscription(&SubscriptionWrite::Update {
                subscription,
                expected_state: expected,
            })
            .await
            .unwrap()
            .unwrap();
    }
}

/// Active record on a fixture plan whose period started `days_elapsed` days ago.
pub fn subscription_fixture(
    user_id: &str,
    plan_name: &str,
    cycle: BillingCycle,
    days_elapsed: i64,
) -> Subscription {
    let plan = catalog()
        .into_iter()
        .find(|p| p.name == plan_name)
        .expect("unknown fixture plan");
    let price_paid = plan
        .price_for(cycle)
        .map(|p| p.price)
        .expect("fixture plan not offered on cycle");
    let period_start = today() - Duration::days(days_elapsed);
    let now = Utc::now();
    Subscription {
        subscription_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        plan_name: plan.name.clone(),
        plan_type: plan.plan_type,
        tier: plan.tier,
        cycle,
        price_paid,
        state: SubscriptionState::Active,
        auto_renew: false,
        period_start,
        expiry_date: cycle.period_end(period_start),
        scheduled_change: None,
        external_subscription_id: None,
        last_payment_id: None,
        created_utc: now,
        updated_utc: now,
    }
}

// =============================================================================
// Postgres
// =============================================================================

static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Migrated Postgres store in a schema of its own, or `None` when
/// `TEST_DATABASE_URL` is not set.
pub async fn test_database() -> Option<Database> {
    let base_url = std::env::var("TEST_DATABASE_URL").ok()?;
    init_metrics();

    let schema_name = format!(
        "test_subscription_{}_{}",
        std::process::id(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&base_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&pool)
        .await
        .ok();
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&pool)
        .await
        .expect("Failed to create test schema");
    pool.close().await;

    let separator = if base_url.contains('?') { "&" } else { "?" };
    let url = format!(
        "{}{}options=-c search_path%3D{}",
        base_url, separator, schema_name
    );
    let db = Database::new(&url, 2, 1)
        .await
        .expect("Failed to create test database");
    db.run_migrations().await.expect("Failed to migrate");
    for plan in catalog() {
        db.upsert_plan(&plan).await.expect("Failed to seed plan");
    }
    Some(db)
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn token_for(user_id: &str, admin: bool) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        admin,
        exp: now + 3600,
        iat: now,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn user_token() -> String {
    token_for(USER, false)
}

pub fn admin_token() -> String {
    token_for("ops-1", true)
}

/// Order id from a checkout response body.
pub fn order_id(checkout: &Value) -> String {
    checkout["data"]["handle"]["orderId"]
        .as_str()
        .expect("checkout has no order handle")
        .to_string()
}

pub fn proof(order_id: &str, payment_id: &str, signature: &str) -> Value {
    serde_json::json!({
        "orderId": order_id,
        "paymentId": payment_id,
        "signature": signature,
    })
}
