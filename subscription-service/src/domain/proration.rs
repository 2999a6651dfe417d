use crate::models::ProrationPreview;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round to whole currency units, halves away from zero.
///
/// Previews and the order amount both go through here, so the user is charged
/// exactly what was quoted.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Quote an immediate upgrade from a plan priced `current_price` for the
/// period `[period_start, period_end)` to a plan priced `target_price`.
pub fn preview_upgrade(
    current_price: Decimal,
    target_price: Decimal,
    period_start: NaiveDate,
    period_end: NaiveDate,
    today: NaiveDate,
) -> ProrationPreview {
    let total_days = (period_end - period_start).num_days().max(1);
    let remaining_days = (period_end - today).num_days().clamp(0, total_days);

    let credit = if remaining_days == 0 || current_price <= Decimal::ZERO {
        Decimal::ZERO
    } else {
        let unused = current_price * Decimal::from(remaining_days) / Decimal::from(total_days);
        round_currency(unused).min(current_price)
    };

    let amount_to_pay = (target_price - credit).max(Decimal::ZERO);

    ProrationPreview {
        new_plan_price: target_price,
        proration_credit: credit,
        amount_to_pay,
        remaining_days,
        total_days,
        is_new_subscription: false,
    }
}

/// Quote for a user with nothing to credit.
pub fn preview_new_subscription(price: Decimal) -> ProrationPreview {
    ProrationPreview {
        new_plan_price: price,
        proration_credit: Decimal::ZERO,
        amount_to_pay: price,
        remaining_days: 0,
        total_days: 0,
        is_new_subscription: true,
    }
}
