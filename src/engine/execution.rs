//! Pre-execution guard: the last checks between operator confirmation and a
//! persisted position.
//!
//! Prices move while a human decides. On confirmation we re-fetch live
//! prices, recompute the edge, and refuse to record a position whose
//! guarantee has evaporated; the operator gets a typed abort carrying the
//! before/after figures instead of a silently created losing trade. The
//! final stakes are naturally rounded and then re-verified for solvency
//! against the raw (pre-commission) prices, with one rebalancing pass
//! allowed to repair what rounding broke.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{info, warn};

use super::matching::fuzzy_match;
use super::quotes::effective_price;
use super::staking::natural_round;
use super::state::{Opportunity, Settings};
use crate::db::models::{TradeRecord, TradeStatus};
use crate::feeds::odds_api::RawEvent;

/// Live profit may fall this far below the alerted profit before we abort.
const MAX_PROFIT_DROP: f64 = 0.50;
/// Falling past this fraction produces a warning but proceeds.
const WARN_PROFIT_DROP: f64 = 0.30;

/// Why a confirmation was refused. Carries enough context for the operator
/// to decide whether to retry or wait for a fresh signal.
#[derive(Debug, Clone, Error)]
pub enum AbortReason {
    #[error("opportunity {signal_id} expired or was already decided")]
    Expired { signal_id: String },
    #[error("edge evaporated: alerted {expected:.4}, live {live:.4}")]
    EdgeGone { expected: Decimal, live: Decimal },
    #[error("arbitrage lost to stake rounding (worst-case profit {profit:.4})")]
    RoundingBrokeArb { profit: Decimal },
}

/// Decide whether the live edge still justifies execution.
///
/// Aborts when live profit is negative or has dropped more than half from
/// the alerted figure; returns the drop fraction as a warning when it
/// exceeds 30%.
pub fn check_live_edge(expected: Decimal, live: Decimal) -> Result<Option<f64>, AbortReason> {
    use rust_decimal::prelude::ToPrimitive;

    let drop = if expected > Decimal::ZERO {
        ((expected - live) / expected).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };
    if live < Decimal::ZERO || drop > MAX_PROFIT_DROP {
        return Err(AbortReason::EdgeGone {
            expected,
            live,
        });
    }
    if drop > WARN_PROFIT_DROP {
        return Ok(Some(drop));
    }
    Ok(None)
}

/// Final stakes after natural rounding and the solvency pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancedStakes {
    /// Display-currency whole units.
    pub stake1: i64,
    pub stake2: i64,
    pub payout1: i64,
    pub payout2: i64,
    /// Worst-case profit fraction at the raw prices.
    pub profit: Decimal,
}

impl BalancedStakes {
    pub fn total(&self) -> i64 {
        self.stake1 + self.stake2
    }
}

fn payout(stake: Decimal, raw_price: Decimal) -> Decimal {
    (stake * raw_price).round_dp(0)
}

fn worst_case_profit(s1: Decimal, s2: Decimal, raw1: Decimal, raw2: Decimal) -> Decimal {
    let total = s1 + s2;
    if total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (payout(s1, raw1).min(payout(s2, raw2)) - total) / total
}

/// Naturally round both display-currency stakes, then verify that the worse
/// of the two payouts still covers the total outlay at the RAW prices. If
/// rounding broke the guarantee, bump the lower-payout leg to the smallest
/// integer stake that restores break-even-or-better; abort if even that
/// leaves the pair underwater.
pub fn round_and_verify(
    stake1_display: Decimal,
    stake2_display: Decimal,
    raw1: Decimal,
    raw2: Decimal,
) -> Result<BalancedStakes, AbortReason> {
    let mut s1 = natural_round(stake1_display);
    let mut s2 = natural_round(stake2_display);

    let rounded_profit = worst_case_profit(s1, s2, raw1, raw2);
    if rounded_profit < Decimal::ZERO {
        let (w1, w2) = (payout(s1, raw1), payout(s2, raw2));
        if w1 <= w2 {
            // leg 1 pays less; raise its stake until it covers leg 2's payout
            s1 = (w2 / raw1).round_dp_with_strategy(0, RoundingStrategy::ToZero) + Decimal::ONE;
        } else {
            s2 = (w1 / raw2).round_dp_with_strategy(0, RoundingStrategy::ToZero) + Decimal::ONE;
        }
        let rebalanced_profit = worst_case_profit(s1, s2, raw1, raw2);
        if rebalanced_profit < Decimal::ZERO {
            warn!(
                "solvency rebalance failed: profit {:.4} after rounding",
                rebalanced_profit
            );
            return Err(AbortReason::RoundingBrokeArb {
                profit: rebalanced_profit,
            });
        }
        info!(
            "solvency rebalance: profit {:.4} -> {:.4}",
            rounded_profit, rebalanced_profit
        );
    }

    use rust_decimal::prelude::ToPrimitive;
    let profit = worst_case_profit(s1, s2, raw1, raw2);
    Ok(BalancedStakes {
        stake1: s1.to_i64().unwrap_or(0),
        stake2: s2.to_i64().unwrap_or(0),
        payout1: payout(s1, raw1).to_i64().unwrap_or(0),
        payout2: payout(s2, raw2).to_i64().unwrap_or(0),
        profit,
    })
}

/// Extract live effective prices for both legs of an opportunity from a
/// fresh odds snapshot. A leg whose source or outcome can't be found keeps
/// its original price: a missing quote is not evidence the edge is gone.
pub fn live_prices_for(
    opp: &Opportunity,
    events: &[RawEvent],
    settings: &Settings,
) -> (Decimal, Decimal) {
    let mut live1 = opp.leg1.price_eff;
    let mut live2 = opp.leg2.price_eff;

    for event in events {
        if !fuzzy_match(&event.name(), &opp.event, 0.7) {
            continue;
        }
        for bm in &event.bookmakers {
            let source = super::quotes::SourceId::from_key(&bm.key);
            let commission = settings
                .sources
                .get(&source)
                .map(|c| c.commission)
                .unwrap_or_default();
            for market in &bm.markets {
                if market.key != "h2h" {
                    continue;
                }
                for outcome in &market.outcomes {
                    let (Some(name), Some(price)) = (outcome.name.as_ref(), outcome.price) else {
                        continue;
                    };
                    if source == opp.leg1.source && fuzzy_match(name, &opp.leg1.outcome, 0.8) {
                        live1 = effective_price(price, commission);
                    } else if source == opp.leg2.source && fuzzy_match(name, &opp.leg2.outcome, 0.8)
                    {
                        live2 = effective_price(price, commission);
                    }
                }
            }
        }
        break;
    }
    (live1, live2)
}

/// Build the persisted record for a confirmed opportunity.
pub fn build_confirmed_record(opp: &Opportunity, stakes: &BalancedStakes) -> TradeRecord {
    TradeRecord {
        signal_id: opp.signal_id.clone(),
        event: opp.event.clone(),
        sport: opp.sport.clone(),
        leg1_source: opp.leg1.source.as_str().to_string(),
        leg2_source: opp.leg2.source.as_str().to_string(),
        leg1_outcome: opp.leg1.outcome.clone(),
        leg2_outcome: opp.leg2.outcome.clone(),
        leg1_price: opp.leg1.price_raw,
        leg2_price: opp.leg2.price_raw,
        stake1: stakes.stake1,
        stake2: stakes.stake2,
        profit_pct: opp.profit,
        status: TradeStatus::Confirmed,
        clv_leg1: None,
        clv_leg2: None,
        realized_profit: None,
        settled_at: None,
        created_at: Utc::now(),
        commence_time: opp.commence,
    }
}

/// Build the record for a rejected opportunity, kept so win-rate stats have
/// a denominator. Rejected records never enter the settlement queue.
pub fn build_rejected_record(opp: &Opportunity, fx_rate: Decimal) -> TradeRecord {
    use rust_decimal::prelude::ToPrimitive;
    TradeRecord {
        signal_id: opp.signal_id.clone(),
        event: opp.event.clone(),
        sport: opp.sport.clone(),
        leg1_source: opp.leg1.source.as_str().to_string(),
        leg2_source: opp.leg2.source.as_str().to_string(),
        leg1_outcome: opp.leg1.outcome.clone(),
        leg2_outcome: opp.leg2.outcome.clone(),
        leg1_price: opp.leg1.price_raw,
        leg2_price: opp.leg2.price_raw,
        stake1: (opp.stake1 * fx_rate).to_i64().unwrap_or(0),
        stake2: (opp.stake2 * fx_rate).to_i64().unwrap_or(0),
        profit_pct: opp.profit,
        status: TradeStatus::Rejected,
        clv_leg1: None,
        clv_leg2: None,
        realized_profit: None,
        settled_at: None,
        created_at: Utc::now(),
        commence_time: opp.commence,
    }
}
