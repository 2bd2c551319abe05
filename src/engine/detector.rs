//! Cross-source opportunity detection.
//!
//! Each scan builds a best-effective-price table per event outcome across
//! every source (bookmakers plus the prediction market, united by fuzzy
//! matching), then tests every cross-source outcome pair for a combined
//! implied probability below one. Staleness, price-band, and cooldown
//! gates run before any pair math; Kelly sizing and per-source caps run
//! after.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::arb::calc_arb;
use super::matching::fuzzy_match;
use super::quotes::{effective_price, Quote, SourceId};
use super::staking::{apply_book_caps, kelly_capital};
use super::state::{EngineState, Opportunity, Settings};
use crate::feeds::odds_api::RawEvent;
use crate::feeds::polymarket::PredictionMarket;

/// Events that started longer ago than this can no longer be arbed.
const MAX_EVENT_AGE_HOURS: i64 = 3;

/// Outcome labels that mean "no winner" in a two-way market.
const NON_OUTCOMES: &[&str] = &["draw", "tie", "no contest", "nc"];

/// A quote is stale when its event started too long ago or the source's
/// reported update time is older than the freshness window.
pub fn is_stale(
    commence: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
    max_quote_age_mins: i64,
    now: DateTime<Utc>,
) -> bool {
    if let Some(ct) = commence {
        if ct < now - Duration::hours(MAX_EVENT_AGE_HOURS) {
            return true;
        }
    }
    if let Some(lu) = last_update {
        if (now - lu) > Duration::minutes(max_quote_age_mins) {
            return true;
        }
    }
    false
}

pub fn is_valid_price(price: Decimal, settings: &Settings) -> bool {
    price >= settings.min_price && price <= settings.max_price
}

/// The prediction-market side of an event, priced as decimal odds.
#[derive(Debug, Clone)]
pub struct UnitedMarket {
    pub url: String,
    pub liquidity: f64,
    /// (outcome name, raw odds, effective odds, token id)
    pub outcomes: [(String, Decimal, Decimal, String); 2],
}

/// Find the prediction market that asks about this fixture and convert its
/// implied probabilities to decimal odds, after fee and an impact-cost
/// discount scaled by how much of the book our typical stake would eat.
pub fn unite_market(
    event_name: &str,
    markets: &[PredictionMarket],
    settings: &Settings,
) -> Option<UnitedMarket> {
    let parts: Vec<&str> = event_name.split(" vs ").collect();
    if parts.len() < 2 {
        return None;
    }
    let (team_a, team_b) = (parts[0].trim(), parts[1].trim());

    let mut best: Option<&PredictionMarket> = None;
    let mut best_score = 0.0f64;
    for m in markets {
        if m.liquidity < settings.poly_min_liquidity {
            continue;
        }
        // prose questions get the low threshold
        if !fuzzy_match(team_a, &m.question, 0.3) || !fuzzy_match(team_b, &m.question, 0.3) {
            continue;
        }
        let question = m.question.to_lowercase();
        let kw_score = super::matching::normalize(team_a)
            .split_whitespace()
            .chain(super::matching::normalize(team_b).split_whitespace())
            .filter(|t| question.contains(*t))
            .count() as f64;
        let liq_bonus = (m.liquidity / 10_000.0).min(3.0);
        let score = kw_score + liq_bonus;
        if score > best_score {
            best_score = score;
            best = Some(m);
        }
    }
    let market = best?;

    // Impact cost: a stake that is a large fraction of daily liquidity will
    // walk the book; discount the effective odds accordingly (≤ 5%).
    let est_stake_usd = (settings.min_kelly_stake / settings.fx_rate)
        .to_f64()
        .unwrap_or(0.0);
    let impact_ratio = if market.liquidity > 0.0 {
        (est_stake_usd / market.liquidity).min(0.10)
    } else {
        0.05
    };
    let impact_adj = Decimal::from_f64(1.0 - impact_ratio * 0.5)?;
    if impact_ratio > 0.03 {
        info!(
            "impact cost on '{}': liq=${:.0} (24h vol ${:.0}) ratio={:.1}% adj={}",
            market.question,
            market.liquidity,
            market.volume_24h,
            impact_ratio * 100.0,
            impact_adj
        );
    }

    let price = |idx: usize| -> Option<(String, Decimal, Decimal, String)> {
        let o = &market.outcomes[idx];
        if o.price <= Decimal::ZERO {
            return None;
        }
        let raw = (Decimal::ONE / o.price).round_dp(3);
        let eff = (raw * (Decimal::ONE - market.fee_pct) * impact_adj).round_dp(3);
        Some((o.name.clone(), raw, eff, o.token_id.clone()))
    };

    Some(UnitedMarket {
        url: market.url(),
        liquidity: market.liquidity,
        outcomes: [price(0)?, price(1)?],
    })
}

/// Best effective price per outcome for one event, across all sources.
fn best_prices(
    event: &RawEvent,
    united: Option<&UnitedMarket>,
    settings: &Settings,
    now: DateTime<Utc>,
) -> HashMap<String, Quote> {
    let mut best: HashMap<String, Quote> = HashMap::new();

    for bm in &event.bookmakers {
        let source = SourceId::from_key(&bm.key);
        let commission = settings
            .sources
            .get(&source)
            .map(|c| c.commission)
            .unwrap_or_default();
        let title = bm.title.clone().unwrap_or_else(|| bm.key.clone());
        for market in &bm.markets {
            if market.key != "h2h" {
                continue;
            }
            for outcome in &market.outcomes {
                let (Some(name), Some(raw)) = (outcome.name.as_ref(), outcome.price) else {
                    // one malformed outcome never sinks the event
                    continue;
                };
                if NON_OUTCOMES.contains(&name.to_lowercase().as_str()) {
                    continue;
                }
                if !is_valid_price(raw, settings) {
                    continue;
                }
                if is_stale(
                    event.commence_time,
                    market.last_update,
                    settings.max_quote_age_mins,
                    now,
                ) {
                    debug!("stale quote dropped: {} {}", event.name(), title);
                    continue;
                }
                let eff = effective_price(raw, commission);
                let better = best
                    .get(name.as_str())
                    .map(|q| eff > q.price_eff)
                    .unwrap_or(true);
                if better {
                    best.insert(
                        name.clone(),
                        Quote {
                            source,
                            source_name: title.clone(),
                            outcome: name.clone(),
                            price_raw: raw,
                            price_eff: eff,
                            last_update: market.last_update,
                            event_ref: event.id.clone(),
                            token_id: None,
                            market_url: None,
                        },
                    );
                }
            }
        }
    }

    if let Some(um) = united {
        let fallback = [
            event.home_team.clone().unwrap_or_default(),
            event.away_team.clone().unwrap_or_default(),
        ];
        for (idx, (name, raw, eff, token_id)) in um.outcomes.iter().enumerate() {
            if !is_valid_price(*eff, settings) {
                continue;
            }
            // unite the market outcome with an existing bookmaker label when
            // the names agree, otherwise fall back to the fixture side
            let matched = best
                .keys()
                .find(|k| fuzzy_match(name, k.as_str(), 0.6))
                .cloned()
                .unwrap_or_else(|| fallback[idx].clone());
            if matched.is_empty() {
                continue;
            }
            let better = best
                .get(&matched)
                .map(|q| *eff > q.price_eff)
                .unwrap_or(true);
            if better {
                best.insert(
                    matched.clone(),
                    Quote {
                        source: SourceId::Polymarket,
                        source_name: "Polymarket".to_string(),
                        outcome: matched,
                        price_raw: *raw,
                        price_eff: *eff,
                        last_update: None,
                        event_ref: event.id.clone(),
                        token_id: Some(token_id.clone()),
                        market_url: Some(um.url.clone()),
                    },
                );
            }
        }
    }

    best
}

/// Scan one cycle's quotes for arbitrage pairs. Mutates the cooldown map
/// (stamping emitted pairs) through `state`.
pub fn find_opportunities(
    state: &mut EngineState,
    odds_by_sport: &HashMap<String, Vec<RawEvent>>,
    markets: &[PredictionMarket],
    now: DateTime<Utc>,
) -> Vec<Opportunity> {
    let settings = state.settings.clone();
    let mut found = Vec::new();

    for (sport, events) in odds_by_sport {
        for event in events {
            let event_name = event.name();
            if is_stale(event.commence_time, None, settings.max_quote_age_mins, now) {
                debug!("stale event skipped: {}", event_name);
                continue;
            }

            let united = unite_market(&event_name, markets, &settings);
            let best = best_prices(event, united.as_ref(), &settings, now);

            let outcomes: Vec<&String> = best.keys().collect();
            for i in 0..outcomes.len() {
                for j in (i + 1)..outcomes.len() {
                    let q1 = &best[outcomes[i]];
                    let q2 = &best[outcomes[j]];
                    if q1.source_name == q2.source_name {
                        continue;
                    }
                    let pair_key =
                        format!("{}|{}|{}", event_name, q1.source_name, q2.source_name);
                    if state.is_on_cooldown(&pair_key, now) {
                        continue;
                    }

                    let split = calc_arb(q1.price_eff, q2.price_eff, settings.total_stake);
                    if split.profit < settings.min_profit || split.profit == Decimal::ZERO {
                        continue;
                    }

                    // size the capital for this edge, then re-split
                    let policy = settings.stake_policy();
                    let capital = kelly_capital(q1.price_eff, q2.price_eff, split.profit, &policy);
                    let split = if capital != settings.total_stake {
                        calc_arb(q1.price_eff, q2.price_eff, capital)
                    } else {
                        split
                    };

                    let cap = |s: SourceId| {
                        settings
                            .sources
                            .get(&s)
                            .map(|c| c.max_stake)
                            .unwrap_or_default()
                    };
                    let Some(split) = apply_book_caps(
                        q1.price_eff,
                        q2.price_eff,
                        &split,
                        cap(q1.source),
                        cap(q2.source),
                        settings.fx_rate,
                        settings.min_profit,
                    ) else {
                        debug!("{}: discarded after stake cap", event_name);
                        continue;
                    };

                    let opp = Opportunity {
                        signal_id: Uuid::new_v4().to_string()[..8].to_string(),
                        sport: sport.clone(),
                        event: event_name.clone(),
                        commence: event.commence_time,
                        leg1: q1.clone(),
                        leg2: q2.clone(),
                        profit: split.profit,
                        stake1: split.stake1,
                        stake2: split.stake2,
                        created_at: now,
                    };
                    info!(
                        "arb found: {} | {:.2}% | {} / {}",
                        event_name,
                        split.profit * Decimal::from(100),
                        q1.source_name,
                        q2.source_name
                    );
                    state.stamp_cooldown(pair_key, now);
                    found.push(opp);
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::test_settings;
    use crate::feeds::odds_api::{RawBookmaker, RawMarket, RawOutcome};
    use rust_decimal_macros::dec;

    fn outcome(name: &str, price: Decimal) -> RawOutcome {
        RawOutcome {
            name: Some(name.to_string()),
            price: Some(price),
        }
    }

    fn bookmaker(key: &str, title: &str, outcomes: Vec<RawOutcome>) -> RawBookmaker {
        RawBookmaker {
            key: key.to_string(),
            title: Some(title.to_string()),
            markets: vec![RawMarket {
                key: "h2h".to_string(),
                last_update: Some(Utc::now()),
                outcomes,
            }],
        }
    }

    fn event(bookmakers: Vec<RawBookmaker>) -> RawEvent {
        RawEvent {
            id: "ev1".to_string(),
            commence_time: Some(Utc::now() + Duration::hours(4)),
            home_team: Some("Arsenal".to_string()),
            away_team: Some("Chelsea".to_string()),
            bookmakers,
        }
    }

    fn scan(state: &mut EngineState, ev: RawEvent) -> Vec<Opportunity> {
        let mut by_sport = HashMap::new();
        by_sport.insert("soccer_epl".to_string(), vec![ev]);
        find_opportunities(state, &by_sport, &[], Utc::now())
    }

    #[test]
    fn test_detects_cross_source_arb() {
        let mut state = EngineState::new(test_settings());
        let ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.10))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
        ]);
        let opps = scan(&mut state, ev);
        assert_eq!(opps.len(), 1);
        assert!(opps[0].profit > dec!(0.06));
        assert_ne!(opps[0].leg1.source_name, opps[0].leg2.source_name);
    }

    #[test]
    fn test_same_source_pair_rejected() {
        let mut state = EngineState::new(test_settings());
        let ev = event(vec![bookmaker(
            "pinnacle",
            "Pinnacle",
            vec![outcome("Arsenal", dec!(2.10)), outcome("Chelsea", dec!(2.15))],
        )]);
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_no_arb_when_margin_above_one() {
        let mut state = EngineState::new(test_settings());
        let ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(1.90))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(1.95))]),
        ]);
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_cooldown_suppresses_repeat_alert() {
        let mut state = EngineState::new(test_settings());
        let make = || {
            event(vec![
                bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.10))]),
                bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
            ])
        };
        assert_eq!(scan(&mut state, make()).len(), 1);
        assert!(scan(&mut state, make()).is_empty());
    }

    #[test]
    fn test_stale_event_skipped() {
        let mut state = EngineState::new(test_settings());
        let mut ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.10))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
        ]);
        ev.commence_time = Some(Utc::now() - Duration::hours(4));
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_stale_quote_skipped() {
        let mut state = EngineState::new(test_settings());
        let mut ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.10))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
        ]);
        // one book's prices are 10 minutes old (freshness window is 5)
        ev.bookmakers[0].markets[0].last_update = Some(Utc::now() - Duration::minutes(10));
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_price_band_filters_extremes() {
        let mut state = EngineState::new(test_settings());
        let ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(20.0))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(1.02))]),
        ]);
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_draw_outcomes_ignored() {
        let mut state = EngineState::new(test_settings());
        let ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Draw", dec!(2.10))]),
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
        ]);
        assert!(scan(&mut state, ev).is_empty());
    }

    #[test]
    fn test_malformed_outcome_does_not_sink_event() {
        let mut state = EngineState::new(test_settings());
        let mut broken = bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.10))]);
        broken.markets[0].outcomes.push(RawOutcome {
            name: None,
            price: Some(dec!(3.0)),
        });
        broken.markets[0].outcomes.push(RawOutcome {
            name: Some("Chelsea (pinnacle)".to_string()),
            price: None,
        });
        let ev = event(vec![
            broken,
            bookmaker("dafabet", "Dafabet", vec![outcome("Chelsea", dec!(2.15))]),
        ]);
        assert_eq!(scan(&mut state, ev).len(), 1);
    }

    #[test]
    fn test_best_price_wins_per_outcome() {
        let settings = test_settings();
        let ev = event(vec![
            bookmaker("pinnacle", "Pinnacle", vec![outcome("Arsenal", dec!(2.05))]),
            bookmaker("onexbet", "1xBet", vec![outcome("Arsenal", dec!(2.12))]),
        ]);
        let best = best_prices(&ev, None, &settings, Utc::now());
        assert_eq!(best["Arsenal"].source_name, "1xBet");
        assert_eq!(best["Arsenal"].price_raw, dec!(2.12));
    }

    #[test]
    fn test_unite_market_matches_question() {
        use crate::feeds::polymarket::{MarketOutcome, PredictionMarket};
        let settings = test_settings();
        let market = PredictionMarket {
            question: "Will Arsenal beat Chelsea?".to_string(),
            slug: "arsenal-chelsea".to_string(),
            outcomes: [
                MarketOutcome {
                    name: "Arsenal".to_string(),
                    price: dec!(0.45),
                    token_id: "t1".to_string(),
                },
                MarketOutcome {
                    name: "Chelsea".to_string(),
                    price: dec!(0.55),
                    token_id: "t2".to_string(),
                },
            ],
            fee_pct: dec!(0.02),
            liquidity: 50_000.0,
            volume_24h: 20_000.0,
        };
        let united = unite_market("Arsenal vs Chelsea", &[market], &settings).unwrap();
        // 1/0.45 ≈ 2.222 raw; effective is lower after the 2% fee
        assert!(united.outcomes[0].1 > dec!(2.2));
        assert!(united.outcomes[0].2 < united.outcomes[0].1);
    }

    #[test]
    fn test_unite_market_respects_liquidity_floor() {
        use crate::feeds::polymarket::{MarketOutcome, PredictionMarket};
        let settings = test_settings();
        let market = PredictionMarket {
            question: "Will Arsenal beat Chelsea?".to_string(),
            slug: "arsenal-chelsea".to_string(),
            outcomes: [
                MarketOutcome {
                    name: "Arsenal".to_string(),
                    price: dec!(0.45),
                    token_id: "t1".to_string(),
                },
                MarketOutcome {
                    name: "Chelsea".to_string(),
                    price: dec!(0.55),
                    token_id: "t2".to_string(),
                },
            ],
            fee_pct: dec!(0.02),
            liquidity: 100.0, // below the 1000 floor
            volume_24h: 100.0,
        };
        assert!(unite_market("Arsenal vs Chelsea", &[market], &settings).is_none());
    }
}
