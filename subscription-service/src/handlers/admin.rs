//! Operator endpoints. Every handler takes [`AdminUser`].

use super::{today, ApiResponse, ValidatedJson};
use crate::models::Plan;
use crate::services::RolloverReport;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use service_core::auth::AdminUser;
use service_core::error::AppError;
use validator::Validate;

pub async fn list_plans(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<ApiResponse<Vec<Plan>>>, AppError> {
    Ok(ApiResponse::ok(state.service.list_plans(true).await?))
}

/// Create or replace the plan at `name`. The path wins over any body name.
pub async fn upsert_plan(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
    Json(mut plan): Json<Plan>,
) -> Result<Json<ApiResponse<Plan>>, AppError> {
    plan.name = name;
    tracing::info!(admin = %admin.user_id, plan = %plan.name, "Admin plan upsert");
    Ok(ApiResponse::ok(state.service.upsert_plan(plan).await?))
}

pub async fn archive_plan(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Plan>>, AppError> {
    tracing::info!(admin = %admin.user_id, plan = %name, "Admin plan archive");
    Ok(ApiResponse::ok(state.service.archive_plan(&name).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageUsageRequest {
    #[validate(range(min = 0))]
    pub bytes_used: i64,
}

pub async fn record_storage_usage(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(user_id): Path<String>,
    ValidatedJson(req): ValidatedJson<StorageUsageRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    state
        .service
        .record_storage_usage(&user_id, req.bytes_used)
        .await?;
    Ok(ApiResponse::ok(
        json!({ "userId": user_id, "bytesUsed": req.bytes_used }),
    ))
}

pub async fn run_rollover(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> Result<Json<ApiResponse<RolloverReport>>, AppError> {
    tracing::info!(admin = %admin.user_id, "Admin rollover triggered");
    let report = state.service.rollover(today(), Utc::now()).await?;
    Ok(ApiResponse::ok(report))
}
