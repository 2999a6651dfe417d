//! Persistence seam for plans, subscriptions, payment attempts and storage
//! usage.

use crate::models::{
    AttemptStatus, HandleKind, PaymentAttempt, Plan, Subscription, SubscriptionState,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Subscription write performed together with an attempt update.
#[derive(Debug, Clone)]
pub enum SubscriptionWrite {
    Insert(Subscription),
    /// Replace the record, but only while it is still in `expected_state`.
    Update {
        subscription: Subscription,
        expected_state: SubscriptionState,
    },
}

/// Terminal outcome recorded on a pending attempt.
#[derive(Debug, Clone)]
pub struct AttemptSettlement {
    pub status: AttemptStatus,
    pub payment_id: Option<String>,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Plans

    async fn list_plans(&self, include_archived: bool) -> Result<Vec<Plan>, AppError>;

    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, AppError>;

    async fn upsert_plan(&self, plan: &Plan) -> Result<Plan, AppError>;

    /// Set `is_active` on a plan. Returns `None` when the plan does not exist.
    async fn set_plan_active(&self, name: &str, active: bool) -> Result<Option<Plan>, AppError>;

    // Subscriptions

    async fn list_user_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError>;

    async fn get_subscription(&self, subscription_id: Uuid)
        -> Result<Option<Subscription>, AppError>;

    async fn find_by_external_subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Apply `write`. Returns `None` when an update lost the race on
    /// `expected_state`.
    async fn write_subscription(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<Option<Subscription>, AppError>;

    /// Records not yet expired whose `expiry_date <= today`.
    async fn list_due_subscriptions(&self, today: NaiveDate)
        -> Result<Vec<Subscription>, AppError>;

    // Payment attempts

    /// Store a new pending attempt together with an optional subscription
    /// write. Earlier pending attempts for the same subscription are marked
    /// abandoned in the same step.
    async fn record_checkout(
        &self,
        attempt: &PaymentAttempt,
        write: Option<&SubscriptionWrite>,
    ) -> Result<PaymentAttempt, AppError>;

    async fn get_attempt_by_handle(
        &self,
        kind: HandleKind,
        provider_ref: &str,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    /// Move a pending attempt to a terminal status and apply `write`
    /// atomically.
    ///
    /// Returns `None` when the attempt was no longer pending; nothing is
    /// written in that case. This is what makes verification idempotent.
    async fn settle_attempt(
        &self,
        attempt_id: Uuid,
        settlement: &AttemptSettlement,
        write: Option<&SubscriptionWrite>,
    ) -> Result<Option<PaymentAttempt>, AppError>;

    async fn list_stale_attempts(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentAttempt>, AppError>;

    // Storage usage

    async fn storage_used(&self, user_id: &str) -> Result<i64, AppError>;

    async fn set_storage_used(&self, user_id: &str, bytes: i64) -> Result<(), AppError>;
}
