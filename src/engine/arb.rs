//! Two-leg arbitrage arithmetic.
//!
//! All money math runs on `Decimal` so profit fractions and stake splits are
//! exact; floats never touch a stake.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Result of splitting a total stake across a two-leg arbitrage pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbSplit {
    /// Guaranteed profit as a fraction of total stake. Zero when no arb.
    pub profit: Decimal,
    pub stake1: Decimal,
    pub stake2: Decimal,
}

impl ArbSplit {
    pub fn none() -> Self {
        ArbSplit {
            profit: Decimal::ZERO,
            stake1: Decimal::ZERO,
            stake2: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.stake1 + self.stake2
    }
}

/// Sum of implied probabilities for a price pair. An arbitrage exists iff
/// the margin is below one.
pub fn margin(price1: Decimal, price2: Decimal) -> Decimal {
    Decimal::ONE / price1 + Decimal::ONE / price2
}

/// Split `total` across two prices so both outcomes pay the same amount.
///
/// `stake1 = total · (1/price1) / margin`, remainder on leg 2. Returns the
/// zero split when the combined implied probability is at or above one.
pub fn calc_arb(price1: Decimal, price2: Decimal, total: Decimal) -> ArbSplit {
    let inv1 = Decimal::ONE / price1;
    let m = inv1 + Decimal::ONE / price2;
    if m >= Decimal::ONE {
        return ArbSplit::none();
    }
    let profit = (Decimal::ONE - m) / m;
    let stake1 = (total * inv1 / m).round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let stake2 = (total - stake1).round_dp_with_strategy(2, RoundingStrategy::ToZero);
    ArbSplit {
        profit,
        stake1,
        stake2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_no_arb_when_margin_at_or_above_one() {
        // 1/2.0 + 1/2.0 = 1.0 exactly
        assert_eq!(calc_arb(dec!(2.0), dec!(2.0), dec!(1000)), ArbSplit::none());
        // heavily juiced pair
        assert_eq!(
            calc_arb(dec!(1.80), dec!(1.90), dec!(1000)),
            ArbSplit::none()
        );
    }

    #[test]
    fn test_known_example() {
        // 2.10 / 2.15 → margin ≈ 0.9412, profit ≈ 6.25%
        let split = calc_arb(dec!(2.10), dec!(2.15), dec!(10000));
        let profit = split.profit;
        assert!(profit > dec!(0.062) && profit < dec!(0.063), "{profit}");
        // stake_1 ≈ 4883, stake_2 ≈ 5117
        assert!(split.stake1 > dec!(4882) && split.stake1 < dec!(4884));
        assert!(split.stake2 > dec!(5116) && split.stake2 < dec!(5118));
    }

    #[test]
    fn test_equal_payout_on_either_outcome() {
        for (p1, p2) in [
            (dec!(2.10), dec!(2.15)),
            (dec!(1.40), dec!(4.20)),
            (dec!(3.00), dec!(1.60)),
        ] {
            let split = calc_arb(p1, p2, dec!(10000));
            if split.profit == Decimal::ZERO {
                continue;
            }
            let pay1 = split.stake1 * p1;
            let pay2 = split.stake2 * p2;
            // Both legs pay the same within stake quantization tolerance
            let diff = (pay1 - pay2).abs();
            assert!(diff < dec!(0.10), "payout mismatch for {p1}/{p2}: {diff}");
        }
    }

    #[test]
    fn test_profit_positive_iff_margin_below_one() {
        let cases = [
            (dec!(2.05), dec!(2.05)),
            (dec!(1.10), dec!(12.0)),
            (dec!(2.00), dec!(2.01)),
        ];
        for (p1, p2) in cases {
            let split = calc_arb(p1, p2, dec!(5000));
            if margin(p1, p2) < Decimal::ONE {
                assert!(split.profit > Decimal::ZERO);
                assert!(split.stake1 > Decimal::ZERO && split.stake2 > Decimal::ZERO);
            } else {
                assert_eq!(split, ArbSplit::none());
            }
        }
    }

    #[test]
    fn test_stakes_never_exceed_total() {
        let split = calc_arb(dec!(2.10), dec!(2.20), dec!(10000));
        assert!(split.total() <= dec!(10000));
    }
}
