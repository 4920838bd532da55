//! Fixed-point money helpers.
//!
//! All arithmetic stays in [`Decimal`]; nothing here touches `f64`.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::Money;

/// Fractional digits carried by every stored amount.
pub const MONEY_SCALE: u32 = 2;

/// Round half away from zero to cents.
#[must_use]
pub fn round_money(value: Decimal) -> Money {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Truncate toward zero to cents.
#[must_use]
pub fn floor_money(value: Decimal) -> Money {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero)
}

/// `amount * percent / 100`, rounded to cents.
#[must_use]
pub fn percent_of(amount: Money, percent: Decimal) -> Money {
    round_money(amount * percent / Decimal::ONE_HUNDRED)
}

/// Whether `value` has at most two fractional digits.
#[must_use]
pub fn is_money(value: Decimal) -> bool {
    value.normalize().scale() <= MONEY_SCALE
}

/// Pin `value` to exactly two fractional digits for display and storage.
#[must_use]
pub fn to_cents(value: Decimal) -> Money {
    let mut v = round_money(value);
    v.rescale(MONEY_SCALE);
    v
}
