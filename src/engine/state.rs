//! All shared mutable engine state, owned by one struct behind one mutex.
//!
//! The scan loop, the settlement sweep, the closing-price watch, and the
//! dashboard's request handlers all touch these collections; serializing
//! them through a single lock keeps every cross-collection invariant (e.g.
//! "a pending opportunity has a log row") simple. The lock is only ever
//! held for in-memory reads and mutations, never across an await point.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::quotes::{Quote, SourceMap};
use super::signals::SignalTracker;
use super::staking::StakePolicy;
use crate::db::models::{LineMovement, OpportunityRow, TradeRecord};
use crate::feeds::odds_api::RawEvent;

/// In-memory history bounds; the database keeps everything.
const MAX_TRADE_RECORDS: usize = 500;
const MAX_OPPORTUNITY_LOG: usize = 100;
const MAX_LINE_MOVEMENTS: usize = 200;
const MAX_SEEN_SIGNALS: usize = 500;
const MAX_PRICE_HISTORY_KEYS: usize = 500;
const MAX_CLOSING_KEYS: usize = 500;

/// Runtime-tunable parameters. A copy lives inside `EngineState` so control
/// commands can change them and the next cycle picks them up without a
/// restart.
#[derive(Debug, Clone)]
pub struct Settings {
    pub auto_scan: bool,
    /// Minimum guaranteed profit fraction to emit an opportunity.
    pub min_profit: Decimal,
    pub scan_interval_secs: u64,
    /// Acceptable effective price band.
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Re-alert suppression per (event, source-pair).
    pub cooldown_mins: i64,
    /// Quotes with an older reported update are stale.
    pub max_quote_age_mins: i64,
    /// Fixed total stake in quote currency when Kelly is off.
    pub total_stake: Decimal,
    /// Display units per quote unit.
    pub fx_rate: Decimal,
    pub use_kelly: bool,
    pub kelly_fraction: Decimal,
    /// Bankroll and Kelly clamps in display currency.
    pub bankroll: Decimal,
    pub min_kelly_stake: Decimal,
    pub max_kelly_stake: Decimal,
    /// Relative price change that counts as a line movement.
    pub line_move_threshold: Decimal,
    pub quota_warn_at: i64,
    /// Prediction-market liquidity floor for quoting (USD).
    pub poly_min_liquidity: f64,
    /// Liquidity above which an RLM signal earns full weight (USD).
    pub rlm_min_liquidity: f64,
    /// Scan sports in rotating batches of this size (0 = all every cycle).
    pub sport_rotation_size: usize,
    pub sources: SourceMap,
}

impl Settings {
    pub fn stake_policy(&self) -> StakePolicy {
        StakePolicy {
            use_kelly: self.use_kelly,
            total_stake: self.total_stake,
            kelly_fraction: self.kelly_fraction,
            bankroll: self.bankroll,
            min_kelly_stake: self.min_kelly_stake,
            max_kelly_stake: self.max_kelly_stake,
            fx_rate: self.fx_rate,
        }
    }
}

/// A detected arbitrage pair awaiting operator confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub signal_id: String,
    pub sport: String,
    pub event: String,
    pub commence: Option<DateTime<Utc>>,
    pub leg1: Quote,
    pub leg2: Quote,
    /// Guaranteed profit fraction at detection time.
    pub profit: Decimal,
    /// Stakes in quote currency.
    pub stake1: Decimal,
    pub stake2: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn total_stake(&self) -> Decimal {
        self.stake1 + self.stake2
    }

    /// Cooldown / dedupe key: same event and source pair.
    pub fn pair_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.event, self.leg1.source_name, self.leg2.source_name
        )
    }
}

/// Queue entry for a confirmed trade awaiting settlement. The record itself
/// lives in `trade_records`; the entry carries the scheduled start so the
/// sweep knows when the grace window has elapsed.
#[derive(Debug, Clone)]
pub struct PendingSettlement {
    pub commence: DateTime<Utc>,
}

/// Watch-list entry for capturing an event's closing prices.
#[derive(Debug, Clone)]
pub struct ClosingWatch {
    pub event: String,
    pub sport: String,
    pub commence: DateTime<Utc>,
    pub done: bool,
}

pub struct EngineState {
    pub settings: Settings,
    /// Opportunities alerted and awaiting confirm/reject, by signal id.
    /// An entry is removed atomically on the first decision; a second
    /// decision for the same id sees "not found" and is treated as expired.
    pub pending: HashMap<String, Opportunity>,
    /// Alerted (event, source-pair) keys, independent of the cooldown map.
    pub seen_signals: HashSet<String>,
    /// (event, source-pair) → last alert time.
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    pub signal_tracker: SignalTracker,
    pub line_movements: Vec<LineMovement>,
    pub opportunity_log: Vec<OpportunityRow>,
    pub trade_records: Vec<TradeRecord>,
    pub pending_settlement: HashMap<String, PendingSettlement>,
    /// "event|sport" → closing-price watch entry.
    pub closing_watch: HashMap<String, ClosingWatch>,
    /// "event|outcome" → source key → closing price.
    pub closing_prices: HashMap<String, HashMap<String, Decimal>>,
    pub scan_count: u64,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub api_remaining: i64,
    pub quota_warned: bool,
    pub rotation_idx: usize,
    /// Short-lived odds cache for the execution guard, per sport.
    pub refetch_cache: HashMap<String, (Instant, Vec<RawEvent>)>,
}

pub type SharedState = Arc<Mutex<EngineState>>;

impl EngineState {
    pub fn new(settings: Settings) -> Self {
        EngineState {
            settings,
            pending: HashMap::new(),
            seen_signals: HashSet::new(),
            cooldowns: HashMap::new(),
            signal_tracker: SignalTracker::new(),
            line_movements: Vec::new(),
            opportunity_log: Vec::new(),
            trade_records: Vec::new(),
            pending_settlement: HashMap::new(),
            closing_watch: HashMap::new(),
            closing_prices: HashMap::new(),
            scan_count: 0,
            last_scan_time: None,
            api_remaining: 500,
            quota_warned: false,
            rotation_idx: 0,
            refetch_cache: HashMap::new(),
        }
    }

    pub fn shared(settings: Settings) -> SharedState {
        Arc::new(Mutex::new(EngineState::new(settings)))
    }

    pub fn is_on_cooldown(&self, pair_key: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns
            .get(pair_key)
            .map(|last| (now - *last) < Duration::minutes(self.settings.cooldown_mins))
            .unwrap_or(false)
    }

    pub fn stamp_cooldown(&mut self, pair_key: String, now: DateTime<Utc>) {
        self.cooldowns.insert(pair_key, now);
    }

    pub fn push_line_movement(&mut self, lm: LineMovement) {
        self.line_movements.push(lm);
        if self.line_movements.len() > MAX_LINE_MOVEMENTS {
            let excess = self.line_movements.len() - MAX_LINE_MOVEMENTS;
            self.line_movements.drain(..excess);
        }
    }

    pub fn push_opportunity_row(&mut self, row: OpportunityRow) {
        self.opportunity_log.push(row);
        if self.opportunity_log.len() > MAX_OPPORTUNITY_LOG {
            let excess = self.opportunity_log.len() - MAX_OPPORTUNITY_LOG;
            self.opportunity_log.drain(..excess);
        }
    }

    pub fn set_opportunity_status(&mut self, signal_id: &str, status: &str) {
        for row in self.opportunity_log.iter_mut() {
            if row.id == signal_id {
                row.status = status.to_string();
            }
        }
    }

    pub fn mark_seen(&mut self, pair_key: String) -> bool {
        if self.seen_signals.len() > MAX_SEEN_SIGNALS {
            self.seen_signals.clear();
        }
        self.seen_signals.insert(pair_key)
    }

    pub fn find_trade_mut(&mut self, signal_id: &str) -> Option<&mut TradeRecord> {
        self.trade_records
            .iter_mut()
            .find(|t| t.signal_id == signal_id)
    }

    pub fn find_trade(&self, signal_id: &str) -> Option<&TradeRecord> {
        self.trade_records.iter().find(|t| t.signal_id == signal_id)
    }

    /// Bound every rolling collection. Called once per scan cycle so a
    /// 24/7 process can't leak memory.
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        if self.trade_records.len() > MAX_TRADE_RECORDS {
            let excess = self.trade_records.len() - MAX_TRADE_RECORDS;
            self.trade_records.drain(..excess);
        }
        let cooldown_ttl = Duration::minutes(self.settings.cooldown_mins * 2);
        self.cooldowns.retain(|_, last| (now - *last) < cooldown_ttl);
        self.signal_tracker.trim(now, MAX_PRICE_HISTORY_KEYS);
        self.closing_watch.retain(|_, w| !w.done);
        if self.closing_prices.len() > MAX_CLOSING_KEYS {
            let excess = self.closing_prices.len() - MAX_CLOSING_KEYS;
            let drop_keys: Vec<_> = self.closing_prices.keys().take(excess).cloned().collect();
            for k in drop_keys {
                self.closing_prices.remove(&k);
            }
        }
    }
}

/// Baseline settings for unit tests across the engine modules.
#[cfg(test)]
pub fn test_settings() -> Settings {
    use rust_decimal_macros::dec;
    Settings {
        auto_scan: true,
        min_profit: dec!(0.015),
        scan_interval_secs: 300,
        min_price: dec!(1.05),
        max_price: dec!(15),
        cooldown_mins: 30,
        max_quote_age_mins: 5,
        total_stake: dec!(285.71),
        fx_rate: dec!(35),
        use_kelly: true,
        kelly_fraction: dec!(0.25),
        bankroll: dec!(100000),
        min_kelly_stake: dec!(10000),
        max_kelly_stake: dec!(50000),
        line_move_threshold: dec!(0.05),
        quota_warn_at: 50,
        poly_min_liquidity: 1000.0,
        rlm_min_liquidity: 10000.0,
        sport_rotation_size: 0,
        sources: SourceMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cooldown_window() {
        let mut state = EngineState::new(test_settings());
        let now = Utc::now();
        let key = "Arsenal vs Chelsea|Pinnacle|Polymarket".to_string();
        assert!(!state.is_on_cooldown(&key, now));
        state.stamp_cooldown(key.clone(), now);
        assert!(state.is_on_cooldown(&key, now + Duration::minutes(29)));
        assert!(!state.is_on_cooldown(&key, now + Duration::minutes(31)));
    }

    #[test]
    fn test_cleanup_expires_cooldowns() {
        let mut state = EngineState::new(test_settings());
        let now = Utc::now();
        state.stamp_cooldown("old".into(), now - Duration::minutes(61));
        state.stamp_cooldown("fresh".into(), now);
        state.cleanup(now);
        assert!(!state.cooldowns.contains_key("old"));
        assert!(state.cooldowns.contains_key("fresh"));
    }

    #[test]
    fn test_line_movement_history_bounded() {
        let mut state = EngineState::new(test_settings());
        for i in 0..250 {
            state.push_line_movement(LineMovement {
                event: format!("event {i}"),
                sport: "basketball_nba".into(),
                source: "Pinnacle".into(),
                outcome: "Home".into(),
                price_before: dec!(2.0),
                price_after: dec!(1.8),
                pct_change: dec!(-0.1),
                direction: crate::db::models::MoveDirection::Down,
                is_steam: false,
                is_rlm: false,
                ts: Utc::now(),
            });
        }
        assert_eq!(state.line_movements.len(), 200);
        // oldest entries were dropped, newest kept
        assert_eq!(state.line_movements.last().unwrap().event, "event 249");
    }

    #[test]
    fn test_seen_signals_reset_after_cap() {
        let mut state = EngineState::new(test_settings());
        for i in 0..=MAX_SEEN_SIGNALS {
            state.mark_seen(format!("key {i}"));
        }
        // next insert clears the set first
        state.mark_seen("overflow".into());
        assert!(state.seen_signals.len() < MAX_SEEN_SIGNALS);
    }
}
