//! Domain models for subscription-service.

mod entitlement;
mod payment;
mod plan;
mod subscription;

pub use entitlement::{ActiveSubscription, Entitlement, ProrationPreview};
pub use payment::{AttemptStatus, CheckoutHandle, HandleKind, PaymentAttempt, PaymentPurpose};
pub use plan::{BillingCycle, Plan, PlanFeatures, PlanPrice, PlanType, FREE_TIER};
pub use subscription::{ChangeType, ScheduledChange, Subscription, SubscriptionState};
