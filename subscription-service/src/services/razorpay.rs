//! Razorpay payment provider client.
//!
//! Orders for one-off charges, Subscriptions for recurring plans, and the
//! HMAC signatures Razorpay attaches to checkout callbacks and webhooks.

use super::gateway::{
    GatewayError, PaymentGateway, PaymentStatus, ProviderOrder, ProviderPayment,
    ProviderSubscription,
};
use crate::config::RazorpayConfig;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder};
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Razorpay client for interacting with the Razorpay API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    /// Amount in smallest currency unit (paise for INR).
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: u64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest<'a> {
    plan_id: &'a str,
    total_count: u32,
    customer_notify: u8,
    notes: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct UpdateSubscriptionRequest<'a> {
    plan_id: &'a str,
    schedule_change_at: &'a str,
    customer_notify: u8,
}

#[derive(Debug, Serialize)]
struct CancelSubscriptionRequest {
    cancel_at_cycle_end: u8,
}

#[derive(Debug, Deserialize)]
struct RazorpaySubscription {
    id: String,
    status: String,
}

/// Razorpay API error response.
#[derive(Debug, Deserialize)]
struct RazorpayError {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

/// Razorpay payment entity, as returned by the API and inside webhooks.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    pub status: String,
    pub order_id: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl From<PaymentEntity> for ProviderPayment {
    fn from(entity: PaymentEntity) -> Self {
        ProviderPayment {
            status: PaymentStatus::from_string(&entity.status),
            id: entity.id,
            order_id: entity.order_id,
            amount: entity.amount,
            error_description: entity.error_description,
        }
    }
}

/// Razorpay webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<WebhookEntity<PaymentEntity>>,
    pub order: Option<WebhookEntity<OrderEntity>>,
    pub subscription: Option<WebhookEntity<SubscriptionEntity>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntity<T> {
    pub entity: T,
}

#[derive(Debug, Deserialize)]
pub struct OrderEntity {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionEntity {
    pub id: String,
    pub status: String,
}

/// Parse webhook event from request body.
pub fn parse_webhook_event(body: &str) -> Result<WebhookEvent, serde_json::Error> {
    serde_json::from_str(body)
}

/// Hex-encoded HMAC-SHA256 of `payload`.
pub fn compute_signature(payload: &str, secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn signature_matches(payload: &str, secret: &str, signature: &str) -> bool {
    if secret.is_empty() || signature.is_empty() {
        return false;
    }
    let expected = compute_signature(payload, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

impl RazorpayClient {
    /// Create a new Razorpay client.
    pub fn new(config: RazorpayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(
            &self.config.key_id,
            Some(self.config.key_secret.expose_secret()),
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let response = self.authed(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(operation, status = %status, "Razorpay response");

        if status.is_success() {
            Ok(serde_json::from_str(&body)?)
        } else {
            let error = serde_json::from_str::<RazorpayError>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| RazorpayErrorDetail {
                    code: status.as_str().to_string(),
                    description: body.clone(),
                });
            tracing::error!(
                operation,
                code = %error.code,
                description = %error.description,
                "Razorpay request failed"
            );
            Err(GatewayError::Rejected {
                code: error.code,
                description: error.description,
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    fn key_id(&self) -> &str {
        &self.config.key_id
    }

    async fn create_order(
        &self,
        amount: u64,
        currency: &str,
        receipt: &str,
        notes: serde_json::Value,
    ) -> Result<ProviderOrder, GatewayError> {
        let url = format!("{}/orders", self.config.api_base_url);
        let request = CreateOrderRequest {
            amount,
            currency,
            receipt,
            notes,
        };

        let order: RazorpayOrder = self
            .send("create_order", self.client.post(&url).json(&request))
            .await?;

        tracing::info!(
            order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            "Razorpay order created"
        );

        Ok(ProviderOrder {
            id: order.id,
            amount: order.amount,
            currency: order.currency,
        })
    }

    async fn create_subscription(
        &self,
        plan_id: &str,
        total_count: u32,
        notes: serde_json::Value,
    ) -> Result<ProviderSubscription, GatewayError> {
        let url = format!("{}/subscriptions", self.config.api_base_url);
        let request = CreateSubscriptionRequest {
            plan_id,
            total_count,
            customer_notify: 1,
            notes,
        };

        let subscription: RazorpaySubscription = self
            .send(
                "create_subscription",
                self.client.post(&url).json(&request),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            plan_id,
            "Razorpay subscription created"
        );

        Ok(ProviderSubscription {
            id: subscription.id,
            status: subscription.status,
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_cycle_end: bool,
    ) -> Result<(), GatewayError> {
        let url = format!(
            "{}/subscriptions/{}/cancel",
            self.config.api_base_url, subscription_id
        );
        let request = CancelSubscriptionRequest {
            cancel_at_cycle_end: u8::from(at_cycle_end),
        };

        let _: RazorpaySubscription = self
            .send(
                "cancel_subscription",
                self.client.post(&url).json(&request),
            )
            .await?;

        tracing::info!(subscription_id, at_cycle_end, "Razorpay subscription cancelled");
        Ok(())
    }

    async fn schedule_plan_change(
        &self,
        subscription_id: &str,
        plan_id: &str,
    ) -> Result<(), GatewayError> {
        let url = format!(
            "{}/subscriptions/{}",
            self.config.api_base_url, subscription_id
        );
        let request = UpdateSubscriptionRequest {
            plan_id,
            schedule_change_at: "cycle_end",
            customer_notify: 1,
        };

        let _: RazorpaySubscription = self
            .send(
                "update_subscription",
                self.client.patch(&url).json(&request),
            )
            .await?;

        tracing::info!(subscription_id, plan_id, "Razorpay plan change scheduled");
        Ok(())
    }

    async fn cancel_scheduled_changes(&self, subscription_id: &str) -> Result<(), GatewayError> {
        let url = format!(
            "{}/subscriptions/{}/cancel_scheduled_changes",
            self.config.api_base_url, subscription_id
        );

        let _: RazorpaySubscription = self
            .send("cancel_scheduled_changes", self.client.post(&url))
            .await?;

        tracing::info!(subscription_id, "Razorpay scheduled change cancelled");
        Ok(())
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<ProviderPayment, GatewayError> {
        let url = format!("{}/payments/{}", self.config.api_base_url, payment_id);
        let payment: PaymentEntity = self.send("fetch_payment", self.client.get(&url)).await?;
        Ok(payment.into())
    }

    /// `HMAC-SHA256(order_id + "|" + payment_id, key_secret)`
    fn verify_order_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = format!("{}|{}", order_id, payment_id);
        let is_valid =
            signature_matches(&payload, self.config.key_secret.expose_secret(), signature);

        if is_valid {
            tracing::info!(order_id, payment_id, "Payment signature verified");
        } else {
            tracing::warn!(order_id, payment_id, "Payment signature verification failed");
        }
        is_valid
    }

    /// `HMAC-SHA256(payment_id + "|" + subscription_id, key_secret)`
    fn verify_subscription_signature(
        &self,
        subscription_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> bool {
        let payload = format!("{}|{}", payment_id, subscription_id);
        let is_valid =
            signature_matches(&payload, self.config.key_secret.expose_secret(), signature);

        if !is_valid {
            tracing::warn!(
                subscription_id,
                payment_id,
                "Subscription payment signature verification failed"
            );
        }
        is_valid
    }

    /// `HMAC-SHA256(request_body, webhook_secret)`
    fn verify_webhook_signature(&self, body: &str, signature: &str) -> bool {
        let is_valid =
            signature_matches(body, self.config.webhook_secret.expose_secret(), signature);

        if !is_valid {
            tracing::warn!("Webhook signature verification failed");
        }
        is_valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn test_config() -> RazorpayConfig {
        RazorpayConfig {
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("my_secret_key".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_base_url: "https://api.razorpay.com/v1".to_string(),
        }
    }

    #[test]
    fn test_is_configured() {
        assert!(RazorpayClient::new(test_config()).is_configured());

        let empty_config = RazorpayConfig {
            key_id: "".to_string(),
            key_secret: Secret::new("".to_string()),
            webhook_secret: Secret::new("".to_string()),
            api_base_url: "".to_string(),
        };
        assert!(!RazorpayClient::new(empty_config).is_configured());
    }

    #[tokio::test]
    async fn unconfigured_client_does_not_call_out() {
        let client = RazorpayClient::new(RazorpayConfig {
            key_id: "".to_string(),
            key_secret: Secret::new("".to_string()),
            webhook_secret: Secret::new("".to_string()),
            api_base_url: "http://127.0.0.1:9".to_string(),
        });
        let err = client.fetch_payment("pay_1").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured));
    }

    #[test]
    fn order_signature() {
        let client = RazorpayClient::new(test_config());
        let signature = compute_signature("order_123|pay_456", "my_secret_key");

        assert!(client.verify_order_signature("order_123", "pay_456", &signature));
        assert!(!client.verify_order_signature("order_123", "pay_789", &signature));
        assert!(!client.verify_order_signature("order_123", "pay_456", "invalid_signature"));
    }

    #[test]
    fn subscription_signature_puts_payment_first() {
        let client = RazorpayClient::new(test_config());
        let signature = compute_signature("pay_456|sub_123", "my_secret_key");

        assert!(client.verify_subscription_signature("sub_123", "pay_456", &signature));
        assert!(!client.verify_subscription_signature("pay_456", "sub_123", &signature));
    }

    #[test]
    fn webhook_signature_and_parsing() {
        let client = RazorpayClient::new(test_config());
        let body = r#"{"event":"payment.captured","payload":{"payment":{"entity":{"id":"pay_1","amount":13300,"currency":"INR","status":"captured","order_id":"order_1"}}}}"#;
        let signature = compute_signature(body, "webhook_secret");

        assert!(client.verify_webhook_signature(body, &signature));
        assert!(!client.verify_webhook_signature(body, ""));

        let event = parse_webhook_event(body).unwrap();
        assert_eq!(event.event, "payment.captured");
        let payment = event.payload.payment.unwrap().entity;
        assert_eq!(payment.order_id.as_deref(), Some("order_1"));
        assert_eq!(
            ProviderPayment::from(payment).status,
            PaymentStatus::Captured
        );
    }
}
