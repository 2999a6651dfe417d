//! Subscription lifecycle transitions.

use crate::models::SubscriptionState;
use service_core::error::AppError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    RequestUpgrade,
    PaymentVerified,
    PaymentFailed,
    RequestDowngrade,
    RevokeScheduledChange,
    Cancel,
    Resume,
    Expire,
    Rollover,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::RequestUpgrade => "upgrade",
            SubscriptionEvent::PaymentVerified => "verify payment for",
            SubscriptionEvent::PaymentFailed => "fail payment for",
            SubscriptionEvent::RequestDowngrade => "schedule a change for",
            SubscriptionEvent::RevokeScheduledChange => "revoke the scheduled change of",
            SubscriptionEvent::Cancel => "cancel",
            SubscriptionEvent::Resume => "resume",
            SubscriptionEvent::Expire => "expire",
            SubscriptionEvent::Rollover => "roll over",
        }
    }
}

impl fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Cannot {event} a subscription in state '{}'", from.as_str())]
pub struct TransitionError {
    pub from: SubscriptionState,
    pub event: SubscriptionEvent,
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        AppError::Conflict(anyhow::Error::new(err))
    }
}

impl SubscriptionState {
    /// Next state after `event`, or an error when the pair is not allowed.
    pub fn apply(self, event: SubscriptionEvent) -> Result<SubscriptionState, TransitionError> {
        use SubscriptionEvent as E;
        use SubscriptionState as S;

        let next = match (self, event) {
            (S::Active | S::PendingUpgradePayment, E::RequestUpgrade) => S::PendingUpgradePayment,
            (S::PendingUpgradePayment, E::PaymentVerified | E::PaymentFailed) => S::Active,
            (S::Active | S::ScheduledDowngrade, E::RequestDowngrade) => S::ScheduledDowngrade,
            (S::ScheduledDowngrade, E::RevokeScheduledChange) => S::Active,
            (S::Active | S::ScheduledDowngrade, E::Cancel) => S::CancelledPendingExpiry,
            (S::CancelledPendingExpiry, E::Resume) => S::Active,
            (S::ScheduledDowngrade, E::Rollover) => S::Active,
            (from, E::Expire) if from != S::Expired => S::Expired,
            (from, event) => return Err(TransitionError { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionEvent as E;
    use SubscriptionState as S;

    #[test]
    fn upgrade_round_trip() {
        let pending = S::Active.apply(E::RequestUpgrade).unwrap();
        assert_eq!(pending, S::PendingUpgradePayment);
        assert_eq!(pending.apply(E::PaymentVerified).unwrap(), S::Active);
        assert_eq!(pending.apply(E::PaymentFailed).unwrap(), S::Active);
        assert_eq!(pending.apply(E::RequestUpgrade).unwrap(), S::PendingUpgradePayment);
    }

    #[test]
    fn downgrade_can_be_replaced_or_revoked() {
        let scheduled = S::Active.apply(E::RequestDowngrade).unwrap();
        assert_eq!(scheduled.apply(E::RequestDowngrade).unwrap(), S::ScheduledDowngrade);
        assert_eq!(scheduled.apply(E::RevokeScheduledChange).unwrap(), S::Active);
        assert_eq!(scheduled.apply(E::Rollover).unwrap(), S::Active);
    }

    #[test]
    fn cancel_then_resume() {
        let cancelled = S::ScheduledDowngrade.apply(E::Cancel).unwrap();
        assert_eq!(cancelled, S::CancelledPendingExpiry);
        assert_eq!(cancelled.apply(E::Resume).unwrap(), S::Active);
        assert_eq!(cancelled.apply(E::Expire).unwrap(), S::Expired);
    }

    #[test]
    fn rejected_pairs() {
        let err = S::Active.apply(E::PaymentVerified).unwrap_err();
        assert_eq!(err.from, S::Active);
        assert!(S::PendingUpgradePayment.apply(E::RequestDowngrade).is_err());
        assert!(S::PendingUpgradePayment.apply(E::Cancel).is_err());
        assert!(S::CancelledPendingExpiry.apply(E::RequestUpgrade).is_err());
        assert!(S::Active.apply(E::Resume).is_err());
        assert!(S::Active.apply(E::Rollover).is_err());
        assert!(S::Expired.apply(E::Expire).is_err());
        assert!(S::Expired.apply(E::Resume).is_err());
    }

    #[test]
    fn every_live_state_can_expire() {
        for state in [
            S::Active,
            S::PendingUpgradePayment,
            S::ScheduledDowngrade,
            S::CancelledPendingExpiry,
        ] {
            assert_eq!(state.apply(E::Expire).unwrap(), S::Expired);
        }
    }

    #[test]
    fn transition_errors_are_conflicts() {
        let err: AppError = S::Expired.apply(E::Cancel).unwrap_err().into();
        assert_eq!(err.code(), "conflict");
    }
}
