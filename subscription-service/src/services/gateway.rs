//! Payment provider seam.

use async_trait::async_trait;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment provider credentials not configured")]
    NotConfigured,

    #[error("Payment provider rejected the request: {code} - {description}")]
    Rejected { code: String, description: String },

    #[error("Payment provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected payment provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotConfigured => AppError::ServiceUnavailable,
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// One-off order created for an exact amount.
#[derive(Debug, Clone)]
pub struct ProviderOrder {
    pub id: String,
    /// Amount in the smallest currency unit.
    pub amount: u64,
    pub currency: String,
}

/// Recurring subscription created against a provider plan.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Created,
    Authorized,
    Captured,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub fn from_string(s: &str) -> Self {
        match s {
            "authorized" => PaymentStatus::Authorized,
            "captured" => PaymentStatus::Captured,
            "refunded" => PaymentStatus::Refunded,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Created,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderPayment {
    pub id: String,
    pub status: PaymentStatus,
    pub order_id: Option<String>,
    pub amount: u64,
    /// Provider's human-readable reason for a failed payment.
    pub error_description: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key id handed to the client checkout widget.
    fn key_id(&self) -> &str;

    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
        notes: serde_json::Value,
    ) -> Result<ProviderOrder, GatewayError>;

    async fn create_subscription(
        &self,
        plan_id: &str,
        total_count: u32,
        notes: serde_json::Value,
    ) -> Result<ProviderSubscription, GatewayError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_cycle_end: bool,
    ) -> Result<(), GatewayError>;

    /// Move `subscription_id` to `plan_id` from its next billing cycle.
    async fn schedule_plan_change(
        &self,
        subscription_id: &str,
        plan_id: &str,
    ) -> Result<(), GatewayError>;

    /// Drop a plan change scheduled with [`PaymentGateway::schedule_plan_change`].
    async fn cancel_scheduled_changes(&self, subscription_id: &str) -> Result<(), GatewayError>;

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError>;

    fn verify_order_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    fn verify_subscription_signature(
        &self,
        subscription_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> bool;

    fn verify_webhook_signature(&self, body: &str, signature: &str) -> bool;
}
