//! Application startup and lifecycle management.

use crate::config::{StoreBackend, SubscriptionConfig};
use crate::handlers;
use crate::services::{
    CheckoutBridge, Database, MemoryStore, PaymentGateway, RazorpayClient, SubscriptionService,
    SubscriptionStore,
};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use secrecy::ExposeSecret;
use service_core::auth::{auth_middleware, AuthUser, TokenVerifier};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_keyed_rate_limiter, keyed_rate_limit_middleware, KeyedRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, RequestId},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SubscriptionConfig,
    pub service: Arc<SubscriptionService>,
    pub verifier: Arc<TokenVerifier>,
    pub checkout_limiter: KeyedRateLimiter,
}

impl AppState {
    pub fn new(
        config: SubscriptionConfig,
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, AppError> {
        let verifier = Arc::new(TokenVerifier::new(&config.auth)?);
        let checkout = CheckoutBridge::new(gateway, config.billing.currency.clone());
        let service = Arc::new(SubscriptionService::new(
            store,
            checkout,
            config.billing.clone(),
        ));
        let checkout_limiter = create_keyed_rate_limiter(
            config.rate_limit.checkout_attempts,
            config.rate_limit.window_seconds,
        );

        Ok(Self {
            config,
            service,
            verifier,
            checkout_limiter,
        })
    }
}

/// Full HTTP surface with its middleware stack.
pub fn build_router(state: AppState) -> Router {
    // Endpoints that talk to the payment provider are charged per user.
    let checkout_routes = Router::new()
        .route("/subscriptions/subscribe", post(handlers::subscriptions::subscribe))
        .route("/subscriptions/upgrade", post(handlers::subscriptions::upgrade))
        .route(
            "/subscriptions/storage-addons",
            post(handlers::subscriptions::purchase_storage_addon),
        )
        .route("/subscriptions/verify", post(handlers::payments::verify))
        .route(
            "/subscriptions/verify-upgrade",
            post(handlers::payments::verify_upgrade),
        )
        .route_layer(from_fn_with_state(
            state.checkout_limiter.clone(),
            keyed_rate_limit_middleware::<AuthUser>,
        ));

    let authenticated_routes = Router::new()
        .route(
            "/subscriptions/entitlements",
            get(handlers::subscriptions::entitlements),
        )
        .route(
            "/subscriptions/proration-preview",
            post(handlers::subscriptions::proration_preview),
        )
        .route("/subscriptions/downgrade", post(handlers::subscriptions::downgrade))
        .route(
            "/subscriptions/scheduled-change",
            delete(handlers::subscriptions::revoke_scheduled_change),
        )
        .route("/subscriptions/cancel", post(handlers::subscriptions::cancel))
        .route("/subscriptions/resume", post(handlers::subscriptions::resume))
        .route("/admin/plans", get(handlers::admin::list_plans))
        .route(
            "/admin/plans/:name",
            put(handlers::admin::upsert_plan).delete(handlers::admin::archive_plan),
        )
        .route(
            "/admin/users/:user_id/storage-usage",
            put(handlers::admin::record_storage_usage),
        )
        .route(
            "/admin/subscriptions/rollover",
            post(handlers::admin::run_rollover),
        )
        .merge(checkout_routes)
        .route_layer(from_fn_with_state(state.verifier.clone(), auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/subscriptions/plans", get(handlers::plans::list_plans))
        .route(
            "/webhooks/razorpay",
            post(handlers::payments::razorpay_webhook),
        )
        .merge(authenticated_routes)
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.as_str())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        // Outside the trace layer so every span carries the id.
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application with the configured store and Razorpay.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        let store: Arc<dyn SubscriptionStore> = match config.store {
            StoreBackend::Postgres => {
                let db = Database::new(
                    config.database.url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await?;
                db.run_migrations().await?;
                Arc::new(db)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let razorpay = RazorpayClient::new(config.razorpay.clone());
        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - checkouts will be rejected");
        }

        Self::build_with(config, store, Arc::new(razorpay)).await
    }

    /// Build around an existing store and gateway.
    pub async fn build_with(
        config: SubscriptionConfig,
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, AppError> {
        let port = config.common.port;
        let state = AppState::new(config, store, gateway)?;
        let router = build_router(state);

        // Port 0 binds a random port for testing.
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(port = self.port, "subscription-service listening");
        axum::serve(self.listener, self.router).await
    }
}
