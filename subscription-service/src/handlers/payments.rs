//! Checkout verification and provider webhooks.

use super::{today, ApiResponse, ValidatedJson};
use crate::models::PaymentPurpose;
use crate::services::{PaymentProof, VerificationOutcome};
use crate::startup::AppState;
use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;
use service_core::auth::AuthUser;
use service_core::error::AppError;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Verify any checkout (order or provider subscription).
pub async fn verify(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(proof): ValidatedJson<PaymentProof>,
) -> Result<Json<ApiResponse<VerificationOutcome>>, AppError> {
    let outcome = state
        .service
        .verify(&user.user_id, &proof, None, today())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

/// Verify an upgrade order; rejects proofs for other checkouts.
pub async fn verify_upgrade(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(proof): ValidatedJson<PaymentProof>,
) -> Result<Json<ApiResponse<VerificationOutcome>>, AppError> {
    if proof.order_id.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "orderId is required to verify an upgrade"
        )));
    }
    let outcome = state
        .service
        .verify(&user.user_id, &proof, Some(PaymentPurpose::Upgrade), today())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

/// Razorpay webhook. The raw body is needed for the signature check.
pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature")))?;

    let outcome = state
        .service
        .handle_webhook(&body, signature, today())
        .await?;
    Ok(ApiResponse::ok(json!({ "outcome": outcome.as_str() })))
}
