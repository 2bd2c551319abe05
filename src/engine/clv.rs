//! Closing-line value tracking.
//!
//! Shortly before an event starts, every source's current price is recorded
//! as the closing reference. A captured price that beats the close is the
//! best available evidence the signal had real edge, independent of the
//! (variance-dominated) settlement result.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

use super::state::{ClosingWatch, EngineState};
use crate::db::models::TradeRecord;

/// Fetch closing prices when an event is within this many minutes of start.
pub const CLOSING_LEAD_MINS: i64 = 1;

pub type ClosingPrices = HashMap<String, HashMap<String, Decimal>>;

fn watch_key(event: &str, sport: &str) -> String {
    format!("{event}|{sport}")
}

fn price_key(event: &str, outcome: &str) -> String {
    format!("{event}|{outcome}")
}

/// Put an event on the closing-price watch list (idempotent).
pub fn register_watch(
    state: &mut EngineState,
    event: &str,
    sport: &str,
    commence: DateTime<Utc>,
) {
    let key = watch_key(event, sport);
    if !state.closing_watch.contains_key(&key) {
        info!("watching closing line: {}", event);
        state.closing_watch.insert(
            key,
            ClosingWatch {
                event: event.to_string(),
                sport: sport.to_string(),
                commence,
                done: false,
            },
        );
    }
}

/// Watches whose fetch moment has arrived. Marks them done so a slow fetch
/// can't double-fire.
pub fn due_watches(state: &mut EngineState, now: DateTime<Utc>) -> Vec<ClosingWatch> {
    let mut due = Vec::new();
    for watch in state.closing_watch.values_mut() {
        if watch.done {
            continue;
        }
        if watch.commence - now <= Duration::minutes(CLOSING_LEAD_MINS) {
            watch.done = true;
            due.push(watch.clone());
        }
    }
    due
}

/// Record one source's closing price for an outcome.
pub fn record_closing(
    state: &mut EngineState,
    event: &str,
    outcome: &str,
    source_key: &str,
    price: Decimal,
) {
    state
        .closing_prices
        .entry(price_key(event, outcome))
        .or_default()
        .insert(source_key.to_lowercase(), price);
}

/// Per-leg closing-line value for a trade: `(captured / closing − 1) × 100`.
/// `None` when no closing price was captured for that source and outcome.
pub fn calc_clv(closing: &ClosingPrices, trade: &TradeRecord) -> (Option<f64>, Option<f64>) {
    let leg = |outcome: &str, source: &str, captured: Decimal| -> Option<f64> {
        let close = closing
            .get(&price_key(&trade.event, outcome))?
            .get(&source.to_lowercase())
            .copied()?;
        if close <= Decimal::ZERO {
            return None;
        }
        let clv = (captured / close - Decimal::ONE) * Decimal::from(100);
        Some((clv.to_f64().unwrap_or(0.0) * 100.0).round() / 100.0)
    };
    let clv1 = leg(&trade.leg1_outcome, &trade.leg1_source, trade.leg1_price);
    let clv2 = leg(&trade.leg2_outcome, &trade.leg2_source, trade.leg2_price);
    debug!(
        "clv for {}: leg1={:?} leg2={:?}",
        trade.signal_id, clv1, clv2
    );
    (clv1, clv2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::db::models::TradeStatus;
    use crate::engine::state::test_settings;
    use rust_decimal_macros::dec;

    fn trade() -> TradeRecord {
        TradeRecord {
            signal_id: "abc12345".to_string(),
            event: "Arsenal vs Chelsea".to_string(),
            sport: "soccer_epl".to_string(),
            leg1_source: "pinnacle".to_string(),
            leg2_source: "polymarket".to_string(),
            leg1_outcome: "Arsenal".to_string(),
            leg2_outcome: "Chelsea".to_string(),
            leg1_price: dec!(2.10),
            leg2_price: dec!(2.15),
            stake1: 10000,
            stake2: 10500,
            profit_pct: dec!(0.0625),
            status: TradeStatus::Confirmed,
            clv_leg1: None,
            clv_leg2: None,
            realized_profit: None,
            settled_at: None,
            created_at: Utc::now(),
            commence_time: None,
        }
    }

    #[test]
    fn test_clv_positive_when_beating_the_close() {
        let mut closing = ClosingPrices::new();
        closing
            .entry("Arsenal vs Chelsea|Arsenal".to_string())
            .or_default()
            .insert("pinnacle".to_string(), dec!(2.00));
        let (clv1, clv2) = calc_clv(&closing, &trade());
        // captured 2.10 over close 2.00 → +5%
        assert_relative_eq!(clv1.unwrap(), 5.0, epsilon = 1e-9);
        assert_eq!(clv2, None); // no closing price for the other leg
    }

    #[test]
    fn test_clv_negative_when_lagging_the_close() {
        let mut closing = ClosingPrices::new();
        closing
            .entry("Arsenal vs Chelsea|Arsenal".to_string())
            .or_default()
            .insert("pinnacle".to_string(), dec!(2.20));
        let (clv1, _) = calc_clv(&closing, &trade());
        assert!(clv1.unwrap() < 0.0);
    }

    #[test]
    fn test_clv_undefined_without_closing_capture() {
        let (clv1, clv2) = calc_clv(&ClosingPrices::new(), &trade());
        assert_eq!(clv1, None);
        assert_eq!(clv2, None);
    }

    #[test]
    fn test_watch_due_one_minute_before_start() {
        let mut state = EngineState::new(test_settings());
        let now = Utc::now();
        register_watch(&mut state, "Arsenal vs Chelsea", "soccer_epl", now + Duration::minutes(10));

        // ten minutes out: not yet
        assert!(due_watches(&mut state, now).is_empty());
        // thirty seconds out: fetch now, and only once
        let due = due_watches(&mut state, now + Duration::minutes(9) + Duration::seconds(30));
        assert_eq!(due.len(), 1);
        assert!(due_watches(&mut state, now + Duration::minutes(10)).is_empty());
    }

    #[test]
    fn test_register_watch_idempotent() {
        let mut state = EngineState::new(test_settings());
        let now = Utc::now();
        register_watch(&mut state, "Arsenal vs Chelsea", "soccer_epl", now);
        register_watch(&mut state, "Arsenal vs Chelsea", "soccer_epl", now);
        assert_eq!(state.closing_watch.len(), 1);
    }

    #[test]
    fn test_record_closing_stores_lowercased_source() {
        let mut state = EngineState::new(test_settings());
        record_closing(&mut state, "Arsenal vs Chelsea", "Arsenal", "Pinnacle", dec!(2.0));
        let (clv1, _) = calc_clv(&state.closing_prices, &trade());
        assert!(clv1.is_some());
    }
}
