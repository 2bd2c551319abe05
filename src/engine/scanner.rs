//! The engine facade: scan cycle, confirmation handling, settlement sweep,
//! closing-price watch, quota tracking, and runtime control.
//!
//! Each long-running loop is an independent task over the same shared
//! state. The scanner waits on a wake signal with the scan interval as a
//! timeout, so control changes (toggling auto-scan, changing the interval,
//! "scan now") take effect immediately instead of after the current
//! interval drains.

use anyhow::{bail, Result};
use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::clv;
use super::detector;
use super::execution::{self, AbortReason};
use super::quotes::{Quote, SourceId};
use super::settlement::{self, FixtureOutcome, ManualOutcome, SportCategory};
use super::signals;
use super::state::{Opportunity, PendingSettlement, SharedState};
use crate::db::models::{OpportunityRow, TradeRecord, TradeStatus};
use crate::db::Database;
use crate::feeds::odds_api::RawEvent;
use crate::feeds::{OddsApiClient, PolymarketClient};
use crate::notify::{Alert, AlertLeg, Notifier, Urgency};

/// Live-odds cache TTL for the execution guard.
const REFETCH_CACHE_SECS: u64 = 15;
/// Quota level at which scanning shuts itself off.
const QUOTA_CRITICAL: i64 = 10;
/// Settlement sweep interval.
const SETTLE_SWEEP_SECS: u64 = 300;
/// Closing-price watch interval.
const CLOSING_WATCH_SECS: u64 = 30;

pub struct ArbEngine {
    state: SharedState,
    db: Database,
    odds: OddsApiClient,
    markets: PolymarketClient,
    notifier: Arc<dyn Notifier>,
    wake: Notify,
    sports: Vec<String>,
}

/// What the operator gets back from a successful confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub signal_id: String,
    pub event: String,
    pub live_profit: Decimal,
    /// Set when live profit dropped more than 30% from the alerted figure.
    pub slippage_warning: Option<f64>,
    pub legs: Vec<AlertLeg>,
    pub total_stake: i64,
    pub instructions: Vec<String>,
}

impl ArbEngine {
    pub fn new(
        state: SharedState,
        db: Database,
        odds: OddsApiClient,
        markets: PolymarketClient,
        notifier: Arc<dyn Notifier>,
        sports: Vec<String>,
    ) -> Self {
        ArbEngine {
            state,
            db,
            odds,
            markets,
            notifier,
            wake: Notify::new(),
            sports,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Startup restore ──────────────────────────────────────────────────────

    /// Reload persisted history and rebuild the settlement queue and
    /// closing-price watch for confirmed trades that never settled.
    pub fn restore_from_db(&self) -> Result<()> {
        let trades = self.db.load_trades(500)?;
        let opps = self.db.load_opportunities(100)?;
        let moves = self.db.load_line_movements(200)?;

        let scan_count: u64 = self.db.load_state("scan_count", "0").parse().unwrap_or(0);
        let api_remaining: i64 = self.db.load_state("api_remaining", "500").parse().unwrap_or(500);
        let saved_auto = self.db.load_state("auto_scan", "");

        let mut state = self.state.lock().unwrap();
        state.scan_count = scan_count;
        state.api_remaining = api_remaining;
        if !saved_auto.is_empty() {
            state.settings.auto_scan = saved_auto == "true";
        }

        let mut restored_queue = 0usize;
        for t in &trades {
            if t.status == TradeStatus::Confirmed && !t.is_settled() {
                let commence = t
                    .commence_time
                    .unwrap_or(t.created_at + chrono::Duration::hours(3));
                state
                    .pending_settlement
                    .insert(t.signal_id.clone(), PendingSettlement { commence });
                clv::register_watch(&mut state, &t.event, &t.sport, commence);
                restored_queue += 1;
            }
        }
        state.trade_records = trades;
        state.opportunity_log = opps;
        state.line_movements = moves;
        info!(
            "restored {} trades ({} awaiting settlement), {} opportunities, {} movements, {} scans",
            state.trade_records.len(),
            restored_queue,
            state.opportunity_log.len(),
            state.line_movements.len(),
            state.scan_count
        );
        Ok(())
    }

    // ── Scan loop ────────────────────────────────────────────────────────────

    pub async fn run_scanner(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(3)).await;
        info!("scanner started ({} sports)", self.sports.len());
        loop {
            let (auto_scan, interval) = {
                let state = self.state.lock().unwrap();
                (state.settings.auto_scan, state.settings.scan_interval_secs)
            };
            if auto_scan {
                if let Err(e) = self.scan_cycle().await {
                    error!("scan cycle failed: {}", e);
                }
            }
            {
                let mut state = self.state.lock().unwrap();
                state.cleanup(Utc::now());
            }
            tokio::select! {
                _ = self.wake.notified() => info!("scanner woken by control change"),
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }
        }
    }

    /// One full detection cycle. Returns the number of alerts sent.
    pub async fn scan_cycle(self: &Arc<Self>) -> Result<usize> {
        let scan_sports = self.rotation_batch();

        // fetch every sport plus the prediction market concurrently
        let odds_futures = scan_sports.iter().map(|s| self.odds.fetch_odds(s));
        let (odds_results, markets) =
            tokio::join!(join_all(odds_futures), self.markets.fetch_markets());

        let mut odds_by_sport: HashMap<String, Vec<RawEvent>> = HashMap::new();
        let mut quota = None;
        for (sport, (events, remaining)) in scan_sports.iter().zip(odds_results) {
            if remaining.is_some() {
                quota = remaining;
            }
            odds_by_sport.insert(sport.clone(), events);
        }
        self.update_quota(quota).await;

        // movement detection is independent of opportunity alerting; let it
        // run without delaying the alerts below
        {
            let engine = Arc::clone(self);
            let odds_snapshot = odds_by_sport.clone();
            tokio::spawn(async move { engine.detect_movements(odds_snapshot).await });
        }

        let now = Utc::now();
        let mut found = {
            let mut state = self.state.lock().unwrap();
            detector::find_opportunities(&mut state, &odds_by_sport, &markets, now)
        };
        found.sort_by(|a, b| b.profit.cmp(&a.profit));

        let mut sent = 0usize;
        for opp in found {
            let fresh = {
                let mut state = self.state.lock().unwrap();
                state.mark_seen(opp.pair_key())
            };
            if !fresh {
                continue;
            }
            self.alert_opportunity(opp).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            sent += 1;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.scan_count += 1;
            state.last_scan_time = Some(Utc::now());
        }
        self.snapshot_state();
        Ok(sent)
    }

    /// Pick this cycle's sports: everything, or a rotating batch when
    /// rotation is configured to conserve feed quota.
    fn rotation_batch(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let size = state.settings.sport_rotation_size;
        if size == 0 || self.sports.len() <= size {
            return self.sports.clone();
        }
        let start = state.rotation_idx % self.sports.len();
        let batch: Vec<String> = self
            .sports
            .iter()
            .cycle()
            .skip(start)
            .take(size)
            .cloned()
            .collect();
        state.rotation_idx = (start + size) % self.sports.len();
        batch
    }

    async fn update_quota(&self, remaining: Option<i64>) {
        let Some(remaining) = remaining else { return };
        let (should_warn, critical) = {
            let mut state = self.state.lock().unwrap();
            state.api_remaining = remaining;
            let critical = remaining <= QUOTA_CRITICAL;
            let should_warn =
                (remaining <= state.settings.quota_warn_at && !state.quota_warned) || critical;
            if should_warn {
                state.quota_warned = true;
            }
            if critical {
                // recoverable, but scanning must be explicitly re-enabled
                state.settings.auto_scan = false;
            }
            (should_warn, critical)
        };
        if should_warn {
            if critical {
                warn!("feed quota critical ({} left); auto-scan disabled", remaining);
            }
            self.notifier
                .send(&Alert::QuotaWarning {
                    remaining,
                    critical,
                })
                .await;
        }
    }

    async fn detect_movements(&self, odds_by_sport: HashMap<String, Vec<RawEvent>>) {
        let now = Utc::now();
        let mut alerts = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let threshold = state.settings.line_move_threshold;
            let rlm_min_liquidity = state.settings.rlm_min_liquidity;
            for (sport, events) in &odds_by_sport {
                for event in events {
                    let event_name = event.name();
                    for bm in &event.bookmakers {
                        let source = SourceId::from_key(&bm.key);
                        let title = bm.title.clone().unwrap_or_else(|| bm.key.clone());
                        for market in &bm.markets {
                            if market.key != "h2h" {
                                continue;
                            }
                            for outcome in &market.outcomes {
                                let (Some(name), Some(price)) =
                                    (outcome.name.as_ref(), outcome.price)
                                else {
                                    continue;
                                };
                                let Some(lm) = state.signal_tracker.observe(
                                    &event_name,
                                    sport,
                                    name,
                                    source,
                                    &title,
                                    price,
                                    threshold,
                                    SourceId::Pinnacle,
                                    now,
                                ) else {
                                    continue;
                                };
                                let moved = state.signal_tracker.sources_moved(
                                    &event_name,
                                    name,
                                    lm.direction,
                                );
                                let (grade, reasons) = signals::grade_signal(
                                    &lm,
                                    0.0,
                                    event.commence_time,
                                    moved,
                                    rlm_min_liquidity,
                                );
                                info!(
                                    "line move: {} | {} {} {}→{} ({:.1}%){}{}",
                                    event_name,
                                    title,
                                    name,
                                    lm.price_before,
                                    lm.price_after,
                                    lm.pct_change * Decimal::from(100),
                                    if lm.is_steam { " steam" } else { "" },
                                    if lm.is_rlm { " rlm" } else { "" },
                                );
                                state.push_line_movement(lm.clone());
                                alerts.push((lm, grade, reasons));
                            }
                        }
                    }
                }
            }
        }
        for (lm, grade, reasons) in alerts {
            self.db.save_line_movement(&lm);
            self.notifier
                .send(&Alert::LineMove {
                    event: lm.event.clone(),
                    sport: lm.sport.clone(),
                    source: lm.source.clone(),
                    outcome: lm.outcome.clone(),
                    price_before: lm.price_before,
                    price_after: lm.price_after,
                    pct_change: lm.pct_change,
                    grade: grade.as_str().to_string(),
                    reasons,
                    is_steam: lm.is_steam,
                    is_rlm: lm.is_rlm,
                })
                .await;
        }
    }

    async fn alert_opportunity(&self, opp: Opportunity) {
        let (fx_rate, use_kelly, api_remaining) = {
            let state = self.state.lock().unwrap();
            (
                state.settings.fx_rate,
                state.settings.use_kelly,
                state.api_remaining,
            )
        };
        let mins_to_start = opp
            .commence
            .map(|ct| (ct - Utc::now()).num_minutes());

        let leg = |q: &Quote, stake: Decimal| {
            let display = (stake * fx_rate).to_i64().unwrap_or(0);
            AlertLeg {
                source: q.source_name.clone(),
                outcome: q.outcome.clone(),
                price: q.price_eff,
                stake: display,
                payout: (stake * q.price_eff * fx_rate).to_i64().unwrap_or(0),
            }
        };
        let legs = vec![leg(&opp.leg1, opp.stake1), leg(&opp.leg2, opp.stake2)];
        let total_stake = legs.iter().map(|l| l.stake).sum();

        let row = OpportunityRow {
            id: opp.signal_id.clone(),
            event: opp.event.clone(),
            sport: opp.sport.clone(),
            profit_pct: opp.profit,
            leg1_source: opp.leg1.source_name.clone(),
            leg1_price: opp.leg1.price_eff,
            leg2_source: opp.leg2.source_name.clone(),
            leg2_price: opp.leg2.price_eff,
            stake1: legs[0].stake,
            stake2: legs[1].stake,
            created_at: opp.created_at,
            status: "pending".to_string(),
        };
        self.db.save_opportunity(&row);

        let alert = Alert::OpportunityFound {
            signal_id: opp.signal_id.clone(),
            event: opp.event.clone(),
            sport: opp.sport.clone(),
            profit_pct: opp.profit,
            legs,
            total_stake,
            mins_to_start,
            urgency: Urgency::from_mins_to_start(mins_to_start),
            market_url: opp
                .leg1
                .market_url
                .clone()
                .or_else(|| opp.leg2.market_url.clone()),
            kelly_sized: use_kelly,
        };
        info!(
            "alerting {} ({:.2}% | quota {})",
            opp.event,
            opp.profit * Decimal::from(100),
            api_remaining
        );
        {
            let mut state = self.state.lock().unwrap();
            state.push_opportunity_row(row);
            state.pending.insert(opp.signal_id.clone(), opp);
        }
        self.notifier.send(&alert).await;
    }

    // ── Confirmation (execution guard) ───────────────────────────────────────

    /// Operator confirmed an opportunity: run the execution guard and, if it
    /// passes, persist the position and queue it for settlement.
    pub async fn confirm(&self, signal_id: &str) -> Result<Confirmation, AbortReason> {
        let (opp, settings) = {
            let mut state = self.state.lock().unwrap();
            let opp = state
                .pending
                .remove(signal_id)
                .ok_or_else(|| AbortReason::Expired {
                    signal_id: signal_id.to_string(),
                })?;
            (opp, state.settings.clone())
        };

        let events = self.live_odds_snapshot(&opp.sport).await;
        let (live1, live2) = execution::live_prices_for(&opp, &events, &settings);
        let live_split = super::arb::calc_arb(live1, live2, opp.total_stake());
        let live_profit = if super::arb::margin(live1, live2) < Decimal::ONE {
            live_split.profit
        } else {
            // a dead pair reads as a fully negative edge, not zero
            Decimal::ONE - super::arb::margin(live1, live2)
        };
        let slippage_warning = execution::check_live_edge(opp.profit, live_profit)?;

        let stakes = execution::round_and_verify(
            opp.stake1 * settings.fx_rate,
            opp.stake2 * settings.fx_rate,
            opp.leg1.price_raw,
            opp.leg2.price_raw,
        )?;
        let record = execution::build_confirmed_record(&opp, &stakes);

        {
            let mut state = self.state.lock().unwrap();
            let commence = opp
                .commence
                .unwrap_or(record.created_at + chrono::Duration::hours(3));
            state
                .pending_settlement
                .insert(record.signal_id.clone(), PendingSettlement { commence });
            clv::register_watch(&mut state, &opp.event, &opp.sport, commence);
            state.set_opportunity_status(signal_id, "confirmed");
            state.trade_records.push(record.clone());
        }
        self.db.save_trade(&record);
        self.db.update_opportunity_status(signal_id, "confirmed");
        info!(
            "confirmed {} | live profit {:.2}%",
            record.event,
            live_profit * Decimal::from(100)
        );

        let instructions = vec![
            leg_instructions(&opp.leg1, stakes.stake1),
            leg_instructions(&opp.leg2, stakes.stake2),
        ];
        Ok(Confirmation {
            signal_id: record.signal_id.clone(),
            event: record.event.clone(),
            live_profit,
            slippage_warning,
            legs: vec![
                AlertLeg {
                    source: opp.leg1.source_name.clone(),
                    outcome: opp.leg1.outcome.clone(),
                    price: opp.leg1.price_raw,
                    stake: stakes.stake1,
                    payout: stakes.payout1,
                },
                AlertLeg {
                    source: opp.leg2.source_name.clone(),
                    outcome: opp.leg2.outcome.clone(),
                    price: opp.leg2.price_raw,
                    stake: stakes.stake2,
                    payout: stakes.payout2,
                },
            ],
            total_stake: stakes.total(),
            instructions,
        })
    }

    /// Operator rejected an opportunity. Recorded for win-rate statistics.
    pub async fn reject(&self, signal_id: &str) -> Result<(), AbortReason> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let opp = state
                .pending
                .remove(signal_id)
                .ok_or_else(|| AbortReason::Expired {
                    signal_id: signal_id.to_string(),
                })?;
            let record = execution::build_rejected_record(&opp, state.settings.fx_rate);
            state.set_opportunity_status(signal_id, "rejected");
            state.trade_records.push(record.clone());
            record
        };
        self.db.save_trade(&record);
        self.db.update_opportunity_status(signal_id, "rejected");
        info!("rejected {}", record.event);
        Ok(())
    }

    /// Live odds for one sport, cached for a few seconds so double-clicked
    /// confirmations don't double-fetch.
    async fn live_odds_snapshot(&self, sport: &str) -> Vec<RawEvent> {
        {
            let state = self.state.lock().unwrap();
            if let Some((at, events)) = state.refetch_cache.get(sport) {
                if at.elapsed() < Duration::from_secs(REFETCH_CACHE_SECS) {
                    return events.clone();
                }
            }
        }
        let (events, remaining) = self.odds.fetch_odds(sport).await;
        self.update_quota(remaining).await;
        let mut state = self.state.lock().unwrap();
        state
            .refetch_cache
            .insert(sport.to_string(), (Instant::now(), events.clone()));
        events
    }

    // ── Settlement ───────────────────────────────────────────────────────────

    pub async fn run_settlement_sweep(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(60)).await;
        info!("settlement sweep started");
        loop {
            if let Err(e) = self.settle_due().await {
                error!("settlement sweep failed: {}", e);
            }
            tokio::time::sleep(Duration::from_secs(SETTLE_SWEEP_SECS)).await;
        }
    }

    /// Settle every queued position whose grace window has elapsed.
    pub async fn settle_due(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<(String, TradeRecord)> = {
            let state = self.state.lock().unwrap();
            state
                .pending_settlement
                .iter()
                .filter(|(_, p)| settlement::is_due(p.commence, now))
                .filter_map(|(sid, _)| state.find_trade(sid).cloned().map(|t| (sid.clone(), t)))
                .collect()
        };
        if due.is_empty() {
            return Ok(());
        }

        let mut sports: Vec<String> = due.iter().map(|(_, t)| t.sport.clone()).collect();
        sports.sort();
        sports.dedup();
        let mut scores_by_sport = HashMap::new();
        for sport in sports {
            let (results, remaining) = self.odds.fetch_scores(&sport).await;
            self.update_quota(remaining).await;
            scores_by_sport.insert(sport, results);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        for (signal_id, trade) in due {
            let results = match scores_by_sport.get(&trade.sport) {
                Some(r) => r.as_slice(),
                None => continue,
            };
            let Some(fixture) = settlement::match_fixture(&trade.event, results) else {
                continue;
            };
            if !fixture.completed {
                if let Some(ct) = fixture.commence_time {
                    if now - ct
                        > chrono::Duration::hours(settlement::POSTPONED_AFTER_HOURS)
                    {
                        warn!("{}: still unfinished 6h past start (postponed?)", trade.event);
                    }
                }
                continue;
            }

            let category = SportCategory::from_sport_key(&trade.sport);
            match settlement::parse_winner(fixture, category) {
                None => continue,
                Some(FixtureOutcome::Draw) => {
                    self.escalate_manual(&signal_id, &trade, "fixture ended in a draw; refund behavior is venue-dependent")
                        .await;
                }
                Some(FixtureOutcome::ManualReview) => {
                    self.escalate_manual(&signal_id, &trade, "result schema could not be parsed")
                        .await;
                }
                Some(FixtureOutcome::Winner(winner)) => {
                    let (profit, _ambiguous) = settlement::realized_pnl(&trade, &winner);
                    let settled = {
                        let mut state = self.state.lock().unwrap();
                        let (clv1, clv2) = clv::calc_clv(&state.closing_prices, &trade);
                        let settled = match state.find_trade_mut(&signal_id) {
                            Some(t) => {
                                let applied = settlement::apply_settlement(t, profit, now);
                                if applied {
                                    t.clv_leg1 = clv1;
                                    t.clv_leg2 = clv2;
                                }
                                applied.then(|| t.clone())
                            }
                            None => None,
                        };
                        state.pending_settlement.remove(&signal_id);
                        settled
                    };
                    if let Some(record) = settled {
                        self.db.save_trade(&record);
                        let total = record.total_staked();
                        self.notifier
                            .send(&Alert::SettlementResult {
                                signal_id: signal_id.clone(),
                                event: record.event.clone(),
                                winner,
                                realized_profit: profit,
                                total_staked: total,
                                roi_pct: if total > 0 {
                                    profit as f64 / total as f64 * 100.0
                                } else {
                                    0.0
                                },
                            })
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn escalate_manual(&self, signal_id: &str, trade: &TradeRecord, reason: &str) {
        warn!("{}: routed to manual review: {}", trade.event, reason);
        {
            let mut state = self.state.lock().unwrap();
            state.pending_settlement.remove(signal_id);
        }
        self.notifier
            .send(&Alert::ManualReviewRequired {
                signal_id: signal_id.to_string(),
                event: trade.event.clone(),
                reason: reason.to_string(),
            })
            .await;
    }

    /// Explicit operator settlement for positions the sweep can't resolve
    /// or that have aged out of its lookback.
    pub async fn manual_settle(&self, signal_id: &str, outcome: ManualOutcome) -> Result<i64> {
        let record = {
            let mut state = self.state.lock().unwrap();
            state.pending_settlement.remove(signal_id);
            let Some(trade) = state.find_trade_mut(signal_id) else {
                bail!("signal id '{}' not found", signal_id);
            };
            if trade.is_settled() {
                bail!("trade '{}' is already settled", signal_id);
            }
            let profit = settlement::manual_pnl(trade, outcome);
            settlement::apply_settlement(trade, profit, Utc::now());
            trade.clone()
        };
        self.db.save_trade(&record);
        Ok(record.realized_profit.unwrap_or(0))
    }

    // ── Closing-price watch ──────────────────────────────────────────────────

    pub async fn run_closing_watch(self: Arc<Self>) {
        info!("closing-price watch started");
        loop {
            if let Err(e) = self.capture_due_closings().await {
                error!("closing-price capture failed: {}", e);
            }
            tokio::time::sleep(Duration::from_secs(CLOSING_WATCH_SECS)).await;
        }
    }

    async fn capture_due_closings(&self) -> Result<()> {
        let due = {
            let mut state = self.state.lock().unwrap();
            clv::due_watches(&mut state, Utc::now())
        };
        for watch in due {
            let (events, remaining) = self.odds.fetch_odds(&watch.sport).await;
            self.update_quota(remaining).await;

            let mut sharp_found = false;
            let mut state = self.state.lock().unwrap();
            for event in &events {
                if event.name() != watch.event {
                    continue;
                }
                for bm in &event.bookmakers {
                    let source = SourceId::from_key(&bm.key);
                    for market in &bm.markets {
                        if market.key != "h2h" {
                            continue;
                        }
                        for outcome in &market.outcomes {
                            let (Some(name), Some(price)) =
                                (outcome.name.as_ref(), outcome.price)
                            else {
                                continue;
                            };
                            clv::record_closing(
                                &mut state,
                                &watch.event,
                                name,
                                source.as_str(),
                                price,
                            );
                            if source == SourceId::Pinnacle {
                                sharp_found = true;
                            }
                        }
                    }
                }
            }
            if sharp_found {
                info!("closing line captured: {}", watch.event);
            } else {
                warn!(
                    "closing line for {} is missing the sharp book; CLV benchmark unreliable",
                    watch.event
                );
            }
        }
        Ok(())
    }

    // ── Runtime control ──────────────────────────────────────────────────────

    /// Apply a runtime configuration change from the command surface. Takes
    /// effect on the next cycle; interval/toggle changes wake the scanner.
    pub fn apply_control(self: &Arc<Self>, key: &str, value: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let msg = match key {
            "auto_scan" => {
                state.settings.auto_scan = matches!(value, "true" | "1" | "on");
                if state.settings.auto_scan {
                    state.quota_warned = false;
                    state.seen_signals.clear();
                }
                self.wake.notify_one();
                format!("auto_scan = {}", state.settings.auto_scan)
            }
            "min_profit" => {
                state.settings.min_profit = value.parse()?;
                format!("min_profit = {}", state.settings.min_profit)
            }
            "scan_interval" => {
                state.settings.scan_interval_secs = value.parse()?;
                self.wake.notify_one();
                format!("scan_interval = {}s", state.settings.scan_interval_secs)
            }
            "max_price" => {
                state.settings.max_price = value.parse()?;
                format!("max_price = {}", state.settings.max_price)
            }
            "min_price" => {
                state.settings.min_price = value.parse()?;
                format!("min_price = {}", state.settings.min_price)
            }
            "cooldown" => {
                state.settings.cooldown_mins = value.parse()?;
                format!("cooldown = {}m", state.settings.cooldown_mins)
            }
            "total_stake" => {
                let display: Decimal = value.parse()?;
                state.settings.total_stake = display / state.settings.fx_rate;
                format!("total_stake = {}", display)
            }
            "kelly_fraction" => {
                state.settings.kelly_fraction = value.parse()?;
                format!("kelly_fraction = {}", state.settings.kelly_fraction)
            }
            "use_kelly" => {
                state.settings.use_kelly = matches!(value, "true" | "1" | "on");
                format!("use_kelly = {}", state.settings.use_kelly)
            }
            "clear_seen" => {
                state.seen_signals.clear();
                "seen signals cleared".to_string()
            }
            "scan_now" => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.scan_cycle().await {
                        error!("manual scan failed: {}", e);
                    }
                });
                "scan triggered".to_string()
            }
            other => bail!("unknown control key: {}", other),
        };
        drop(state);
        self.db.save_state(&format!("cfg_{key}"), value);
        Ok(msg)
    }

    fn snapshot_state(&self) {
        let (scan_count, auto_scan, api_remaining, last_scan) = {
            let state = self.state.lock().unwrap();
            (
                state.scan_count,
                state.settings.auto_scan,
                state.api_remaining,
                state.last_scan_time,
            )
        };
        self.db.save_state("scan_count", &scan_count.to_string());
        self.db.save_state("auto_scan", &auto_scan.to_string());
        self.db.save_state("api_remaining", &api_remaining.to_string());
        if let Some(ts) = last_scan {
            self.db.save_state("last_scan_time", &ts.to_rfc3339());
        }
    }
}

/// Operator bet-placement steps for one leg. Execution is manual; the
/// engine only writes the checklist.
fn leg_instructions(leg: &Quote, stake: i64) -> String {
    match leg.source {
        SourceId::Polymarket => format!(
            "open {} | pick '{}' | place {} USDC",
            leg.market_url.as_deref().unwrap_or("https://polymarket.com"),
            leg.outcome,
            stake
        ),
        SourceId::Pinnacle => format!(
            "open https://www.pinnacle.com (event {}) | pick '{}' @ {} | place {}",
            leg.event_ref, leg.outcome, leg.price_raw, stake
        ),
        SourceId::OneXBet => format!(
            "open https://1xbet.com/en/line (event {}) | pick '{}' @ {} | place {}",
            leg.event_ref, leg.outcome, leg.price_raw, stake
        ),
        SourceId::Dafabet => format!(
            "open https://www.dafabet.com/en/sports | find '{}' @ {} | place {}",
            leg.outcome, leg.price_raw, stake
        ),
        SourceId::Other => format!(
            "open {} | pick '{}' @ {} | place {}",
            leg.source_name, leg.outcome, leg.price_raw, stake
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{test_settings, EngineState};
    use crate::notify::LogNotifier;
    use rust_decimal_macros::dec;

    fn engine_with(settings: crate::engine::state::Settings) -> Arc<ArbEngine> {
        let state = EngineState::shared(settings);
        let db = Database::open(":memory:").unwrap();
        let odds = OddsApiClient::new("http://localhost:0", "test-key", "pinnacle").unwrap();
        let markets = PolymarketClient::new("http://localhost:0").unwrap();
        Arc::new(ArbEngine::new(
            state,
            db,
            odds,
            markets,
            Arc::new(LogNotifier),
            vec!["basketball_nba".to_string(), "soccer_epl".to_string()],
        ))
    }

    fn pending_opportunity(engine: &Arc<ArbEngine>) -> Opportunity {
        let quote = |source: SourceId, name: &str, outcome: &str, price: Decimal| Quote {
            source,
            source_name: name.to_string(),
            outcome: outcome.to_string(),
            price_raw: price,
            price_eff: price,
            last_update: None,
            event_ref: "ev1".to_string(),
            token_id: None,
            market_url: None,
        };
        let opp = Opportunity {
            signal_id: "sig00001".to_string(),
            sport: "basketball_nba".to_string(),
            event: "Lakers vs Celtics".to_string(),
            commence: Some(Utc::now() + chrono::Duration::hours(5)),
            leg1: quote(SourceId::Pinnacle, "Pinnacle", "Lakers", dec!(2.10)),
            leg2: quote(SourceId::Dafabet, "Dafabet", "Celtics", dec!(2.15)),
            profit: dec!(0.0625),
            stake1: dec!(4883.0),
            stake2: dec!(5117.0),
            created_at: Utc::now(),
        };
        engine
            .state()
            .lock()
            .unwrap()
            .pending
            .insert(opp.signal_id.clone(), opp.clone());
        opp
    }

    #[tokio::test]
    async fn test_second_confirmation_sees_expired() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        // pre-warm the refetch cache so confirm() never leaves the process
        engine
            .state()
            .lock()
            .unwrap()
            .refetch_cache
            .insert(opp.sport.clone(), (Instant::now(), vec![]));

        let first = engine.confirm(&opp.signal_id).await;
        assert!(first.is_ok(), "{first:?}");
        let second = engine.confirm(&opp.signal_id).await;
        assert!(matches!(second, Err(AbortReason::Expired { .. })));
    }

    #[tokio::test]
    async fn test_confirm_registers_settlement_and_watch() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        engine
            .state()
            .lock()
            .unwrap()
            .refetch_cache
            .insert(opp.sport.clone(), (Instant::now(), vec![]));

        engine.confirm(&opp.signal_id).await.unwrap();
        let state = engine.state().lock().unwrap();
        assert!(state.pending_settlement.contains_key(&opp.signal_id));
        assert_eq!(state.closing_watch.len(), 1);
        assert_eq!(state.trade_records.len(), 1);
        assert_eq!(state.trade_records[0].status, TradeStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_reject_records_rejection() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        engine.reject(&opp.signal_id).await.unwrap();
        let state = engine.state().lock().unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(state.trade_records[0].status, TradeStatus::Rejected);
        assert!(state.pending_settlement.is_empty());
    }

    #[tokio::test]
    async fn test_manual_settle_leg1() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        engine
            .state()
            .lock()
            .unwrap()
            .refetch_cache
            .insert(opp.sport.clone(), (Instant::now(), vec![]));
        engine.confirm(&opp.signal_id).await.unwrap();

        let profit = engine
            .manual_settle(&opp.signal_id, ManualOutcome::Leg1)
            .await
            .unwrap();
        let state = engine.state().lock().unwrap();
        let trade = state.find_trade(&opp.signal_id).unwrap();
        assert_eq!(trade.realized_profit, Some(profit));
        assert!(trade.settled_at.is_some());
        assert!(state.pending_settlement.is_empty());
    }

    #[tokio::test]
    async fn test_manual_settle_twice_fails() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        engine
            .state()
            .lock()
            .unwrap()
            .refetch_cache
            .insert(opp.sport.clone(), (Instant::now(), vec![]));
        engine.confirm(&opp.signal_id).await.unwrap();

        engine
            .manual_settle(&opp.signal_id, ManualOutcome::Void)
            .await
            .unwrap();
        assert!(engine
            .manual_settle(&opp.signal_id, ManualOutcome::Leg1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_apply_control_changes_settings() {
        let engine = engine_with(test_settings());
        engine.apply_control("min_profit", "0.02").unwrap();
        engine.apply_control("cooldown", "45").unwrap();
        engine.apply_control("use_kelly", "off").unwrap();
        let state = engine.state().lock().unwrap();
        assert_eq!(state.settings.min_profit, dec!(0.02));
        assert_eq!(state.settings.cooldown_mins, 45);
        assert!(!state.settings.use_kelly);
    }

    #[tokio::test]
    async fn test_apply_control_rejects_unknown_key() {
        let engine = engine_with(test_settings());
        assert!(engine.apply_control("bogus", "1").is_err());
    }

    #[test]
    fn test_rotation_batches_cycle() {
        let mut settings = test_settings();
        settings.sport_rotation_size = 1;
        let engine = engine_with(settings);
        let b1 = engine.rotation_batch();
        let b2 = engine.rotation_batch();
        let b3 = engine.rotation_batch();
        assert_eq!(b1.len(), 1);
        assert_ne!(b1, b2);
        assert_eq!(b1, b3); // wrapped around
    }

    #[tokio::test]
    async fn test_restore_rebuilds_settlement_queue() {
        let engine = engine_with(test_settings());
        let opp = pending_opportunity(&engine);
        engine
            .state()
            .lock()
            .unwrap()
            .refetch_cache
            .insert(opp.sport.clone(), (Instant::now(), vec![]));
        engine.confirm(&opp.signal_id).await.unwrap();

        // simulate a restart with the same database
        let restarted = Arc::new(ArbEngine::new(
            EngineState::shared(test_settings()),
            engine.db().clone(),
            OddsApiClient::new("http://localhost:0", "test-key", "pinnacle").unwrap(),
            PolymarketClient::new("http://localhost:0").unwrap(),
            Arc::new(LogNotifier),
            vec!["basketball_nba".to_string()],
        ));
        restarted.restore_from_db().unwrap();
        let state = restarted.state().lock().unwrap();
        assert_eq!(state.trade_records.len(), 1);
        assert!(state.pending_settlement.contains_key(&opp.signal_id));
        assert_eq!(state.closing_watch.len(), 1);
    }
}
