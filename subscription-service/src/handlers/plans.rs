use super::ApiResponse;
use crate::models::Plan;
use crate::startup::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

/// Public catalog: active plans, subscriptions by tier then add-ons.
pub async fn list_plans(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<PlansResponse>>, AppError> {
    let plans = state.service.list_plans(false).await?;
    Ok(ApiResponse::ok(PlansResponse { plans }))
}
