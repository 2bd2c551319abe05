//! Stake sizing: fractional-Kelly capital, per-source caps, natural rounding.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use super::arb::{calc_arb, margin, ArbSplit};

/// Parameters feeding the Kelly capital computation. Display-currency values
/// (bankroll, clamps) convert to quote currency by `fx_rate` at the end.
#[derive(Debug, Clone)]
pub struct StakePolicy {
    pub use_kelly: bool,
    /// Fixed total stake in quote currency, used when Kelly is off or the
    /// edge degenerates.
    pub total_stake: Decimal,
    pub kelly_fraction: Decimal,
    /// Bankroll in display currency.
    pub bankroll: Decimal,
    pub min_kelly_stake: Decimal,
    pub max_kelly_stake: Decimal,
    /// Display units per quote unit.
    pub fx_rate: Decimal,
}

/// Size the total capital for a detected edge.
///
/// For a true arbitrage the edge is the guaranteed profit fraction, so
/// `full_kelly = edge / (1 − min implied probability)`; a fractional
/// multiplier tames variance. The result is clamped to the configured
/// band, naturally rounded, and returned in quote currency.
pub fn kelly_capital(
    price1: Decimal,
    price2: Decimal,
    profit: Decimal,
    policy: &StakePolicy,
) -> Decimal {
    if !policy.use_kelly {
        return policy.total_stake;
    }
    let min_prob = (Decimal::ONE / price1).min(Decimal::ONE / price2);
    if min_prob >= Decimal::ONE || profit <= Decimal::ZERO {
        return policy.total_stake;
    }
    let full_kelly = profit / (Decimal::ONE - min_prob);
    let frac_kelly = full_kelly * policy.kelly_fraction;

    let mut capital = (frac_kelly * policy.bankroll)
        .max(policy.min_kelly_stake)
        .min(policy.max_kelly_stake);
    capital = natural_round(capital);
    capital = capital.max(policy.min_kelly_stake);

    debug!(
        "kelly: edge={:.4} full={:.4} frac={:.4} capital={}",
        profit, full_kelly, frac_kelly, capital
    );
    capital / policy.fx_rate
}

/// Round a display-currency stake to a human-plausible denomination: floor
/// to a 500 step below 50 000 (1 000 above), then add zero or one step at
/// random so repeated stakes don't land on identical numbers.
pub fn natural_round(amount: Decimal) -> Decimal {
    natural_round_with(amount, rand::random::<bool>())
}

fn natural_round_with(amount: Decimal, add_step: bool) -> Decimal {
    let step = if amount < Decimal::from(50_000) {
        Decimal::from(500)
    } else {
        Decimal::from(1_000)
    };
    let base = (amount / step).floor() * step;
    if add_step {
        base + step
    } else {
        base
    }
}

/// Enforce per-source maximum stakes, rebalancing the whole pair.
///
/// Capping one leg alone would break the equal-payout property, so when a
/// leg exceeds its cap we derive the largest total capital that keeps the
/// capped leg at its limit and recompute both stakes from that. Returns
/// `None` when the rebalanced pair no longer clears `min_profit`; the
/// caller must discard the opportunity rather than emit it understated.
pub fn apply_book_caps(
    price1: Decimal,
    price2: Decimal,
    split: &ArbSplit,
    cap1: Decimal,
    cap2: Decimal,
    fx_rate: Decimal,
    min_profit: Decimal,
) -> Option<ArbSplit> {
    let capped1 = cap_stake(split.stake1, cap1, fx_rate);
    let capped2 = cap_stake(split.stake2, cap2, fx_rate);
    if capped1 == split.stake1 && capped2 == split.stake2 {
        return Some(split.clone());
    }

    let m = margin(price1, price2);
    let new_total = if capped1 < split.stake1 {
        capped1 / (Decimal::ONE / price1) * m
    } else {
        capped2 / (Decimal::ONE / price2) * m
    };
    let rebalanced = calc_arb(price1, price2, new_total);
    if rebalanced.profit < min_profit {
        debug!(
            "cap rebalance dropped profit below minimum ({} < {})",
            rebalanced.profit, min_profit
        );
        return None;
    }
    Some(rebalanced)
}

fn cap_stake(stake: Decimal, cap_display: Decimal, fx_rate: Decimal) -> Decimal {
    if cap_display > Decimal::ZERO && stake * fx_rate > cap_display {
        (cap_display / fx_rate).round_dp_with_strategy(2, RoundingStrategy::ToZero)
    } else {
        stake
    }
}
