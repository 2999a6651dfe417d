//! Endpoints acting on the caller's own subscriptions.

use super::{today, ApiResponse, ValidatedJson};
use crate::models::{BillingCycle, Entitlement, ProrationPreview, Subscription};
use crate::services::CheckoutOutcome;
use crate::startup::AppState;
use axum::{extract::State, Json};
use serde::Deserialize;
use service_core::auth::AuthUser;
use service_core::error::AppError;
use validator::Validate;

/// Target plan and cycle for a checkout, preview or scheduled change.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanSelection {
    #[validate(length(min = 1, max = 64))]
    pub plan_name: String,
    pub cycle: BillingCycle,
}

pub async fn entitlements(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Entitlement>>, AppError> {
    let entitlement = state.service.entitlements(&user.user_id, today()).await?;
    Ok(ApiResponse::ok(entitlement))
}

pub async fn proration_preview(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<PlanSelection>,
) -> Result<Json<ApiResponse<ProrationPreview>>, AppError> {
    let preview = state
        .service
        .proration_preview(&user.user_id, &req.plan_name, req.cycle, today())
        .await?;
    Ok(ApiResponse::ok(preview))
}

pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<PlanSelection>,
) -> Result<Json<ApiResponse<CheckoutOutcome>>, AppError> {
    let outcome = state
        .service
        .subscribe(&user.user_id, &req.plan_name, req.cycle, today())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

pub async fn upgrade(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<PlanSelection>,
) -> Result<Json<ApiResponse<CheckoutOutcome>>, AppError> {
    let outcome = state
        .service
        .upgrade(&user.user_id, &req.plan_name, req.cycle, today())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

pub async fn purchase_storage_addon(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<PlanSelection>,
) -> Result<Json<ApiResponse<CheckoutOutcome>>, AppError> {
    let outcome = state
        .service
        .purchase_storage_addon(&user.user_id, &req.plan_name, req.cycle)
        .await?;
    Ok(ApiResponse::ok(outcome))
}

pub async fn downgrade(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<PlanSelection>,
) -> Result<Json<ApiResponse<Subscription>>, AppError> {
    let subscription = state
        .service
        .downgrade(&user.user_id, &req.plan_name, req.cycle, today())
        .await?;
    Ok(ApiResponse::ok(subscription))
}

pub async fn revoke_scheduled_change(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Subscription>>, AppError> {
    let subscription = state
        .service
        .revoke_scheduled_change(&user.user_id, today())
        .await?;
    Ok(ApiResponse::ok(subscription))
}

pub async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Subscription>>, AppError> {
    let subscription = state.service.cancel(&user.user_id, today()).await?;
    Ok(ApiResponse::ok(subscription))
}

pub async fn resume(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Subscription>>, AppError> {
    let subscription = state.service.resume(&user.user_id, today()).await?;
    Ok(ApiResponse::ok(subscription))
}
