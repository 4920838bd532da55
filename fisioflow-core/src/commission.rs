//! Commission snapshot frozen onto a session at completion.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::{percent_of, to_cents};
use crate::partner::CommissionSplit;
use crate::types::Money;

/// The split and the amounts it produced for one gross price.
///
/// `platform_fee + gateway_fee + tax_fee + partner_net == gross` holds
/// exactly: the three fees are rounded to cents, each capped at what is left
/// of the gross, and the partner takes the remainder. `partner_net` is never
/// negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSnapshot {
    /// Percentages in force at completion.
    pub split: CommissionSplit,
    /// Platform commission.
    pub platform_fee: Money,
    /// Gateway fee.
    pub gateway_fee: Money,
    /// Tax withheld.
    pub tax_fee: Money,
    /// Net credited to the partner.
    pub partner_net: Money,
}

impl CommissionSnapshot {
    /// Split `gross` according to `split`.
    #[must_use]
    pub fn compute(gross: Money, split: CommissionSplit) -> Self {
        let mut left = gross;
        let mut take = |pct: Decimal| {
            let fee = to_cents(percent_of(gross, pct).min(left));
            left -= fee;
            fee
        };
        let platform_fee = take(split.platform);
        let gateway_fee = take(split.gateway);
        let tax_fee = take(split.tax);
        let partner_net = to_cents(left);
        Self {
            split,
            platform_fee,
            gateway_fee,
            tax_fee,
            partner_net,
        }
    }

    /// Sum of the three fees.
    #[must_use]
    pub fn fees_total(&self) -> Money {
        self.platform_fee + self.gateway_fee + self.tax_fee
    }

    /// Sum of every part; equals the gross it was computed from.
    #[must_use]
    pub fn total(&self) -> Money {
        self.fees_total() + self.partner_net
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn standard_split_of_one_hundred() {
        let split = CommissionSplit::new(dec!(10), dec!(3), dec!(2), dec!(85));
        let snap = CommissionSnapshot::compute(dec!(100.00), split);
        assert_eq!(snap.platform_fee, dec!(10.00));
        assert_eq!(snap.gateway_fee, dec!(3.00));
        assert_eq!(snap.tax_fee, dec!(2.00));
        assert_eq!(snap.partner_net, dec!(85.00));
        assert_eq!(snap.partner_net.to_string(), "85.00");
    }

    #[test]
    fn awkward_price_still_sums_exactly() {
        let split = CommissionSplit::new(dec!(12.5), dec!(3.99), dec!(1.01), dec!(82.5));
        let snap = CommissionSnapshot::compute(dec!(33.33), split);
        assert_eq!(snap.total(), dec!(33.33));
    }

    #[test]
    fn rounded_fees_never_overdraw_the_gross() {
        let split = CommissionSplit::new(dec!(33), dec!(33), dec!(33), dec!(1));
        let snap = CommissionSnapshot::compute(dec!(0.05), split);
        assert_eq!(snap.platform_fee, dec!(0.02));
        assert_eq!(snap.gateway_fee, dec!(0.02));
        assert_eq!(snap.tax_fee, dec!(0.01));
        assert_eq!(snap.partner_net, dec!(0.00));

        let split = CommissionSplit::new(dec!(50), dec!(50), dec!(0), dec!(0));
        let snap = CommissionSnapshot::compute(dec!(1.01), split);
        assert_eq!(snap.fees_total(), dec!(1.01));
        assert_eq!(snap.partner_net, dec!(0.00));
    }

    proptest! {
        #[test]
        fn fees_leave_a_non_negative_net(
            cents in 1i64..100_000,
            platform in 0i64..=10_000,
            gateway in 0i64..=10_000,
        ) {
            let gross = Decimal::new(cents, 2);
            let platform = Decimal::new(platform, 2);
            let gateway = (Decimal::ONE_HUNDRED - platform).min(Decimal::new(gateway, 2));
            let tax = Decimal::ONE_HUNDRED - platform - gateway;
            let split = CommissionSplit::new(platform, gateway, tax, Decimal::ZERO);
            prop_assert!(split.validate().is_ok());

            let snap = CommissionSnapshot::compute(gross, split);
            prop_assert!(!snap.partner_net.is_sign_negative());
            prop_assert!(!snap.tax_fee.is_sign_negative());
            prop_assert_eq!(snap.total(), gross);
        }

        #[test]
        fn parts_always_sum_to_gross(
            cents in 1i64..10_000_000,
            platform in 0i64..=4000,
            gateway in 0i64..=3000,
            tax in 0i64..=3000,
        ) {
            let gross = Decimal::new(cents, 2);
            let platform = Decimal::new(platform, 2);
            let gateway = Decimal::new(gateway, 2);
            let tax = Decimal::new(tax, 2);
            let partner = Decimal::ONE_HUNDRED - platform - gateway - tax;
            let split = CommissionSplit::new(platform, gateway, tax, partner);
            prop_assert!(split.validate().is_ok());

            let snap = CommissionSnapshot::compute(gross, split);
            prop_assert_eq!(snap.total(), gross);
        }
    }
}
