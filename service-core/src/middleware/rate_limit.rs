use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by an arbitrary string (user id, client id).
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Request extension that knows which bucket it should be charged to.
pub trait RateLimitKey: Clone + Send + Sync + 'static {
    fn rate_limit_key(&self) -> String;
}

/// Allow `attempts` requests per `window_seconds` for each key, with the full
/// allowance available as a burst.
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    let attempts = attempts.max(1);
    let window_ms = (window_seconds.max(1) * 1000) / attempts as u64;
    let quota = Quota::with_period(Duration::from_millis(window_ms.max(1)))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN));

    Arc::new(RateLimiter::dashmap(quota))
}

/// Middleware charging each request to the key found in request extensions.
///
/// Requests without a key (unauthenticated) pass through; the auth layer
/// rejects those on protected routes.
pub async fn keyed_rate_limit_middleware<K: RateLimitKey>(
    State(limiter): State<KeyedRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(key) = request.extensions().get::<K>().map(|k| k.rate_limit_key()) else {
        return Ok(next.run(request).await);
    };

    match limiter.check_key(&key) {
        Ok(_) => Ok(next.run(request).await),
        Err(negative) => {
            let wait_time = negative.wait_time_from(DefaultClock::default().now());
            tracing::warn!(key = %key, wait_secs = wait_time.as_secs(), "Rate limit exceeded");
            Err(AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                Some(wait_time.as_secs().max(1)),
            ))
        }
    }
}
