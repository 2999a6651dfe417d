//! HTTP handlers for subscription-service.

pub mod admin;
pub mod payments;
pub mod plans;
pub mod subscriptions;

use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use service_core::error::AppError;
use validator::Validate;

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// JSON body that has been deserialized and passed its `validator` rules.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid request body: {}", e)))?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Calendar day used for entitlement and period arithmetic.
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": state.config.service_name,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Ready once the store answers.
pub async fn readiness_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state.service.health_check().await.map_err(|e| {
        tracing::warn!(error = %e, "Readiness check failed");
        AppError::ServiceUnavailable
    })?;
    Ok((StatusCode::OK, Json(json!({ "status": "ready" }))))
}

pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
