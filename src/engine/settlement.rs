//! Settlement: resolving confirmed positions against final results.
//!
//! Positions enter a pending queue at confirmation. Once an event's
//! scheduled start plus a grace window has elapsed, the sweep fetches that
//! sport's final scores, locates the fixture with the entity matcher, and
//! determines the winner with a sport-category parser. Anything the
//! parsers can't resolve (draws, unknown score encodings) goes to
//! manual review rather than being guessed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, warn};

use super::matching::fuzzy_match;
use crate::db::models::TradeRecord;
use crate::feeds::odds_api::RawResult;

/// Scores are not fetched until this long after the scheduled start.
pub const GRACE_HOURS: i64 = 2;
/// An incomplete fixture this far past its start is probably postponed.
pub const POSTPONED_AFTER_HOURS: i64 = 6;

/// How a sport encodes its final result, driving which parser runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SportCategory {
    /// Highest numeric score wins (basketball, american football, baseball).
    Numeric,
    /// Numeric, but a tie is a real outcome (soccer).
    NumericWithDraw,
    /// Scores are set lines like "6-4 7-5" (tennis).
    SetBased,
    /// Scores may be method-of-victory strings (MMA).
    Categorical,
}

impl SportCategory {
    pub fn from_sport_key(key: &str) -> Self {
        let k = key.to_lowercase();
        if k.contains("mma") {
            SportCategory::Categorical
        } else if k.contains("tennis") {
            SportCategory::SetBased
        } else if k.contains("soccer") {
            SportCategory::NumericWithDraw
        } else {
            SportCategory::Numeric
        }
    }
}

/// Outcome of parsing one completed fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureOutcome {
    Winner(String),
    Draw,
    /// The schema defeated us; a human must settle this one.
    ManualReview,
}

/// Whether a position's grace window has elapsed.
pub fn is_due(commence: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= commence + Duration::hours(GRACE_HOURS)
}

/// Find the completed fixture matching a recorded event name.
pub fn match_fixture<'a>(trade_event: &str, results: &'a [RawResult]) -> Option<&'a RawResult> {
    let parts: Vec<&str> = trade_event.split(" vs ").collect();
    let (team_a, team_b) = (parts.first()?, parts.last()?);
    results.iter().find(|r| {
        let home = r.home_team.as_deref().unwrap_or("");
        let away = r.away_team.as_deref().unwrap_or("");
        fuzzy_match(home, team_a, 0.5) && fuzzy_match(away, team_b, 0.5)
    })
}

/// Determine the winner of a completed fixture. Returns `None` when the
/// fixture isn't finished or carries no scores at all (stay queued), and
/// `ManualReview` when the score encoding can't be parsed.
pub fn parse_winner(result: &RawResult, category: SportCategory) -> Option<FixtureOutcome> {
    if !result.completed {
        return None;
    }
    let scores = match &result.scores {
        Some(s) if !s.is_empty() => s,
        _ => {
            warn!("completed fixture {} has no scores", result.id);
            return None;
        }
    };

    match category {
        SportCategory::SetBased => Some(parse_set_based(scores)),
        SportCategory::Categorical | SportCategory::Numeric => {
            Some(parse_numeric(scores, false))
        }
        SportCategory::NumericWithDraw => Some(parse_numeric(scores, true)),
    }
}

fn parse_numeric(scores: &[crate::feeds::odds_api::RawScore], draws: bool) -> FixtureOutcome {
    let mut parsed: Vec<(f64, &str)> = Vec::with_capacity(scores.len());
    for s in scores {
        let Some(v) = s.score.as_deref().and_then(|x| x.trim().parse::<f64>().ok()) else {
            warn!("unparseable score {:?} for {}", s.score, s.name);
            return FixtureOutcome::ManualReview;
        };
        parsed.push((v, s.name.as_str()));
    }
    parsed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    if draws && parsed.len() >= 2 && parsed[0].0 == parsed[parsed.len() - 1].0 {
        return FixtureOutcome::Draw;
    }
    FixtureOutcome::Winner(parsed[0].1.to_string())
}

/// Count sets won from lines like "6-4 7-5"; most sets wins.
fn parse_set_based(scores: &[crate::feeds::odds_api::RawScore]) -> FixtureOutcome {
    let mut set_wins: Vec<(usize, &str)> = Vec::with_capacity(scores.len());
    for s in scores {
        let Some(line) = s.score.as_deref() else {
            return FixtureOutcome::ManualReview;
        };
        let mut wins = 0usize;
        for pair in line.split_whitespace() {
            let Some((own, opp)) = pair.split_once('-') else {
                return FixtureOutcome::ManualReview;
            };
            let (Ok(own), Ok(opp)) = (own.trim().parse::<i32>(), opp.trim().parse::<i32>()) else {
                return FixtureOutcome::ManualReview;
            };
            if own > opp {
                wins += 1;
            }
        }
        set_wins.push((wins, s.name.as_str()));
    }
    set_wins.sort_by(|a, b| b.0.cmp(&a.0));
    match set_wins.first() {
        Some((_, name)) => FixtureOutcome::Winner(name.to_string()),
        None => FixtureOutcome::ManualReview,
    }
}

fn leg_payout(stake: i64, raw_price: Decimal) -> i64 {
    (Decimal::from(stake) * raw_price)
        .round_dp_with_strategy(0, RoundingStrategy::ToZero)
        .to_i64()
        .unwrap_or(0)
}

/// Realized P&L for a settled position given the winner's name.
///
/// The winner is fuzzy-matched against both recorded legs. When it matches
/// exactly one, that leg's payout settles the trade. When it matches both
/// or neither, we conservatively assume the lower of the two payouts, a
/// policy choice that may understate profit on legitimately won pairs, so
/// it is logged loudly and correctable via manual settlement.
pub fn realized_pnl(trade: &TradeRecord, winner: &str) -> (i64, bool) {
    let total = trade.total_staked();
    let matches_leg1 = fuzzy_match(winner, &trade.leg1_outcome, 0.5);
    let matches_leg2 = fuzzy_match(winner, &trade.leg2_outcome, 0.5);

    let (payout, ambiguous) = match (matches_leg1, matches_leg2) {
        (true, false) => (leg_payout(trade.stake1, trade.leg1_price), false),
        (false, true) => (leg_payout(trade.stake2, trade.leg2_price), false),
        _ => {
            warn!(
                "{}: winner '{}' ambiguous (legs '{}' / '{}'), assuming worst case",
                trade.event, winner, trade.leg1_outcome, trade.leg2_outcome
            );
            let p1 = leg_payout(trade.stake1, trade.leg1_price);
            let p2 = leg_payout(trade.stake2, trade.leg2_price);
            (p1.min(p2), true)
        }
    };
    (payout - total, ambiguous)
}

/// Mark a trade settled. Returns false when the record is already terminal,
/// making repeat processing of the same fixture a no-op.
pub fn apply_settlement(trade: &mut TradeRecord, profit: i64, now: DateTime<Utc>) -> bool {
    if trade.is_settled() {
        return false;
    }
    trade.realized_profit = Some(profit);
    trade.settled_at = Some(now);
    info!(
        "settled {} | profit {:+} | total staked {}",
        trade.event,
        profit,
        trade.total_staked()
    );
    true
}

/// Operator-selected outcome for positions the sweep can't resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualOutcome {
    Leg1,
    Leg2,
    Draw,
    Void,
}

impl ManualOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "leg1" => Some(ManualOutcome::Leg1),
            "leg2" => Some(ManualOutcome::Leg2),
            "draw" => Some(ManualOutcome::Draw),
            "void" => Some(ManualOutcome::Void),
            _ => None,
        }
    }
}

/// P&L for an explicit manual settlement. Draw and void settle flat; the
/// venue-specific refund question stays with the operator.
pub fn manual_pnl(trade: &TradeRecord, outcome: ManualOutcome) -> i64 {
    let total = trade.total_staked();
    match outcome {
        ManualOutcome::Leg1 => leg_payout(trade.stake1, trade.leg1_price) - total,
        ManualOutcome::Leg2 => leg_payout(trade.stake2, trade.leg2_price) - total,
        ManualOutcome::Draw | ManualOutcome::Void => 0,
    }
}
