//! Plan changes on an existing subscription record.
//!
//! Every function takes the record by reference and returns the updated copy;
//! callers persist it guarded by the state they read.

use super::state::{SubscriptionEvent, TransitionError};
use crate::models::{
    BillingCycle, ChangeType, Plan, ScheduledChange, Subscription, SubscriptionState,
};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ChangeError {
    #[error("'{0}' is not a higher tier than the current plan; use downgrade instead")]
    NotAnUpgrade(String),

    #[error("'{0}' is a higher tier than the current plan; use upgrade instead")]
    NotADowngrade(String),

    #[error("Already subscribed to '{0}' on this billing cycle")]
    SamePlan(String),

    #[error("Plan '{plan}' is not offered on the {} cycle", cycle.as_str())]
    CycleUnavailable { plan: String, cycle: BillingCycle },

    #[error("Subscription already expired")]
    AlreadyExpired,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<ChangeError> for AppError {
    fn from(err: ChangeError) -> Self {
        match err {
            ChangeError::Transition(t) => t.into(),
            expired @ ChangeError::AlreadyExpired => AppError::Conflict(anyhow::Error::new(expired)),
            other => AppError::BadRequest(anyhow::Error::new(other)),
        }
    }
}

pub fn ensure_cycle(plan: &Plan, cycle: BillingCycle) -> Result<(), ChangeError> {
    match plan.price_for(cycle) {
        Some(_) => Ok(()),
        None => Err(ChangeError::CycleUnavailable {
            plan: plan.name.clone(),
            cycle,
        }),
    }
}

pub fn ensure_upgrade(current: &Subscription, target: &Plan) -> Result<(), ChangeError> {
    if target.tier <= current.tier {
        return Err(ChangeError::NotAnUpgrade(target.name.clone()));
    }
    Ok(())
}

/// Move the record into `pending_upgrade_payment`.
pub fn begin_upgrade(current: &Subscription, target: &Plan) -> Result<Subscription, ChangeError> {
    ensure_upgrade(current, target)?;
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::RequestUpgrade)?;
    Ok(next)
}

/// Grant the upgraded plan after its payment was verified. A fresh period
/// worth `price_paid` starts today and is paid by a one-off order, so the
/// record no longer renews through the provider.
pub fn complete_upgrade(
    current: &Subscription,
    target: &Plan,
    cycle: BillingCycle,
    price_paid: Decimal,
    today: NaiveDate,
) -> Result<Subscription, ChangeError> {
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::PaymentVerified)?;
    next.plan_name = target.name.clone();
    next.tier = target.tier;
    next.cycle = cycle;
    next.price_paid = price_paid;
    next.period_start = today;
    next.expiry_date = cycle.period_end(today);
    next.scheduled_change = None;
    next.external_subscription_id = None;
    next.auto_renew = false;
    Ok(next)
}

/// Return a pending upgrade to its previous plan, unchanged.
pub fn abort_upgrade(current: &Subscription) -> Result<Subscription, ChangeError> {
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::PaymentFailed)?;
    Ok(next)
}

/// Record a change to a lower tier, or a cycle switch on the same tier, for
/// the end of the current period.
pub fn schedule_change(
    current: &Subscription,
    target: &Plan,
    cycle: BillingCycle,
) -> Result<Subscription, ChangeError> {
    ensure_cycle(target, cycle)?;
    if target.tier > current.tier {
        return Err(ChangeError::NotADowngrade(target.name.clone()));
    }
    if target.name == current.plan_name && cycle == current.cycle {
        return Err(ChangeError::SamePlan(target.name.clone()));
    }

    let change_type = if target.tier == current.tier && cycle == BillingCycle::Yearly {
        ChangeType::Upgrade
    } else {
        ChangeType::Downgrade
    };

    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::RequestDowngrade)?;
    next.scheduled_change = Some(ScheduledChange {
        change_type,
        new_plan_name: target.name.clone(),
        new_cycle: cycle,
        effective_date: current.expiry_date,
    });
    Ok(next)
}

pub fn revoke_change(current: &Subscription) -> Result<Subscription, ChangeError> {
    let mut next = current.clone();
    next.state = current
        .state
        .apply(SubscriptionEvent::RevokeScheduledChange)?;
    next.scheduled_change = None;
    Ok(next)
}

pub fn cancel(current: &Subscription) -> Result<Subscription, ChangeError> {
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::Cancel)?;
    next.auto_renew = false;
    next.scheduled_change = None;
    Ok(next)
}

pub fn resume(current: &Subscription, today: NaiveDate) -> Result<Subscription, ChangeError> {
    if current.expiry_date <= today {
        return Err(ChangeError::AlreadyExpired);
    }
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::Resume)?;
    Ok(next)
}

pub fn expire(current: &Subscription) -> Result<Subscription, ChangeError> {
    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::Expire)?;
    next.scheduled_change = None;
    Ok(next)
}

/// Swap in the scheduled plan and start its period at the old expiry.
/// `price_paid` is what was collected for that period, if anything.
pub fn apply_scheduled_change(
    current: &Subscription,
    target: &Plan,
    price_paid: Decimal,
) -> Result<Subscription, ChangeError> {
    let Some(change) = current.scheduled_change.as_ref() else {
        return Err(TransitionError {
            from: current.state,
            event: SubscriptionEvent::Rollover,
        }
        .into());
    };

    let mut next = current.clone();
    next.state = current.state.apply(SubscriptionEvent::Rollover)?;
    next.plan_name = target.name.clone();
    next.tier = target.tier;
    next.cycle = change.new_cycle;
    next.price_paid = price_paid;
    next.period_start = current.expiry_date;
    next.expiry_date = change.new_cycle.period_end(current.expiry_date);
    next.scheduled_change = None;
    Ok(next)
}

/// Whether a provider renewal charge received on `today` pays for the next
/// period of `sub`.
pub fn renewal_due(sub: &Subscription, today: NaiveDate, grace_days: i64) -> bool {
    sub.expiry_date <= today + Duration::days(grace_days)
}

/// Extend a provider-renewed record by one cycle, switching to the scheduled
/// plan when one is set. `amount_paid` is the renewal charge.
pub fn renew(
    current: &Subscription,
    scheduled_plan: Option<&Plan>,
    payment_id: &str,
    amount_paid: Decimal,
) -> Result<Subscription, ChangeError> {
    let mut next = match (current.scheduled_change.as_ref(), scheduled_plan) {
        (Some(_), Some(plan)) => apply_scheduled_change(current, plan, amount_paid)?,
        _ => {
            let mut next = current.clone();
            next.price_paid = amount_paid;
            next.period_start = current.expiry_date;
            next.expiry_date = current.cycle.period_end(current.expiry_date);
            next
        }
    };
    next.last_payment_id = Some(payment_id.to_string());
    Ok(next)
}

/// What the rollover job does with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverAction {
    /// Not due yet, or waiting for a provider renewal.
    Keep,
    ApplyScheduledChange,
    Expire,
}

/// Decide the rollover step for `sub` on `today`.
///
/// Records renewed by the provider get `grace_days` past expiry for the
/// renewal to arrive before they expire. Their scheduled changes are applied
/// by the renewal itself, never by rollover.
pub fn rollover_action(sub: &Subscription, today: NaiveDate, grace_days: i64) -> RolloverAction {
    if sub.state == SubscriptionState::Expired || sub.expiry_date > today {
        return RolloverAction::Keep;
    }

    let provider_renews = sub.auto_renew && sub.external_subscription_id.is_some();
    match sub.state {
        // Settled or abandoned by the attempt sweep first.
        SubscriptionState::PendingUpgradePayment => RolloverAction::Keep,
        SubscriptionState::Active | SubscriptionState::ScheduledDowngrade
            if provider_renews && sub.expiry_date + Duration::days(grace_days) > today =>
        {
            RolloverAction::Keep
        }
        SubscriptionState::ScheduledDowngrade
            if !provider_renews && sub.scheduled_change.is_some() =>
        {
            RolloverAction::ApplyScheduledChange
        }
        _ => RolloverAction::Expire,
    }
}
