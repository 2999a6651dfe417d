pub mod checkout;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod razorpay;
pub mod store;
pub mod subscriptions;

pub use checkout::{CheckoutBridge, PaymentProof, Verdict};
pub use database::Database;
pub use gateway::{
    GatewayError, PaymentGateway, PaymentStatus, ProviderOrder, ProviderPayment,
    ProviderSubscription,
};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use razorpay::RazorpayClient;
pub use store::{AttemptSettlement, SubscriptionStore, SubscriptionWrite};
pub use subscriptions::{
    CheckoutOutcome, RolloverReport, SubscriptionService, VerificationOutcome, WebhookOutcome,
};
