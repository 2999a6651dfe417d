//! Business rules with no I/O. Services load records, call into these
//! functions, and persist the result.

pub mod catalog;
pub mod changes;
pub mod entitlements;
pub mod proration;
pub mod state;

pub use catalog::{sort_catalog, validate_plan, CatalogError};
pub use changes::{rollover_action, ChangeError, RolloverAction};
pub use entitlements::{current_subscription, resolve};
pub use proration::{preview_new_subscription, preview_upgrade, round_currency};
pub use state::{SubscriptionEvent, TransitionError};
