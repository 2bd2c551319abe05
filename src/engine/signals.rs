//! Line-movement detection and signal grading.
//!
//! Independently of arbitrage detection, every scan's prices are compared
//! with the last observed price per (event, outcome, source). Moves beyond
//! the configured threshold become `LineMovement`s, flagged as steam when
//! several sources shift together and as reverse line movement when the
//! sharp reference book shortens an outcome. A weighted score turns each
//! movement into an A/B/C grade that shapes alert framing only; grading
//! never gates opportunity detection.

use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use super::quotes::SourceId;
use crate::db::models::{LineMovement, MoveDirection};

/// Sources must move within this window to count as one steam event.
const STEAM_WINDOW_SECS: i64 = 300;

/// Sports where informed money concentrates on the head-to-head market.
const FOCUS_SPORTS: &[&str] = &[
    "basketball_nba",
    "basketball_euroleague",
    "basketball_ncaab",
    "tennis_atp_wimbledon",
    "tennis_wta",
    "americanfootball_nfl",
];

pub fn is_focus_sport(sport: &str) -> bool {
    FOCUS_SPORTS.contains(&sport)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    A,
    B,
    C,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
        }
    }
}

/// Rolling price memory per (event, outcome, source) plus the steam window.
#[derive(Debug, Default)]
pub struct SignalTracker {
    /// (event, outcome) → source → last observed effective price
    last_price: HashMap<(String, String), HashMap<SourceId, Decimal>>,
    /// (event, outcome, direction) → recent movers in the steam window
    steam: HashMap<(String, String, MoveDirection), Vec<(SourceId, DateTime<Utc>)>>,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly observed price. Returns the movement when the
    /// relative change against this source's last price crosses
    /// `threshold`; `sources_moved` reports the steam-window count.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        event: &str,
        sport: &str,
        outcome: &str,
        source: SourceId,
        source_name: &str,
        price: Decimal,
        threshold: Decimal,
        sharp_source: SourceId,
        now: DateTime<Utc>,
    ) -> Option<LineMovement> {
        let key = (event.to_string(), outcome.to_string());
        let prev = self.last_price.get(&key).and_then(|m| m.get(&source)).copied();
        self.last_price.entry(key).or_default().insert(source, price);

        let old = prev?;
        if old <= Decimal::ZERO {
            return None;
        }
        let pct = (price - old) / old;
        if pct.abs() < threshold {
            return None;
        }
        let direction = if pct > Decimal::ZERO {
            MoveDirection::Up
        } else {
            MoveDirection::Down
        };

        let steam_key = (event.to_string(), outcome.to_string(), direction);
        let movers = self.steam.entry(steam_key).or_default();
        movers.push((source, now));
        movers.retain(|(_, t)| (now - *t) < Duration::seconds(STEAM_WINDOW_SECS));
        let distinct_sources = {
            let mut seen: Vec<SourceId> = Vec::new();
            for (s, _) in movers.iter() {
                if !seen.contains(s) {
                    seen.push(*s);
                }
            }
            seen.len()
        };
        let is_steam = distinct_sources >= 2;
        let is_rlm = source == sharp_source && pct < -threshold;

        Some(LineMovement {
            event: event.to_string(),
            sport: sport.to_string(),
            source: source_name.to_string(),
            outcome: outcome.to_string(),
            price_before: old,
            price_after: price,
            pct_change: pct,
            direction,
            is_steam,
            is_rlm,
            ts: now,
        })
    }

    /// Distinct sources currently inside the steam window for a move.
    pub fn sources_moved(&self, event: &str, outcome: &str, direction: MoveDirection) -> usize {
        self.steam
            .get(&(event.to_string(), outcome.to_string(), direction))
            .map(|movers| {
                let mut seen: Vec<SourceId> = Vec::new();
                for (s, _) in movers {
                    if !seen.contains(s) {
                        seen.push(*s);
                    }
                }
                seen.len()
            })
            .unwrap_or(0)
    }

    /// Drop stale steam entries and bound the price-history map.
    pub fn trim(&mut self, now: DateTime<Utc>, max_price_keys: usize) {
        for movers in self.steam.values_mut() {
            movers.retain(|(_, t)| (now - *t) < Duration::seconds(STEAM_WINDOW_SECS));
        }
        self.steam.retain(|_, movers| !movers.is_empty());
        if self.last_price.len() > max_price_keys {
            let excess = self.last_price.len() - max_price_keys;
            let drop_keys: Vec<_> = self.last_price.keys().take(excess).cloned().collect();
            for k in drop_keys {
                self.last_price.remove(&k);
            }
        }
    }
}

/// How close to kickoff (or what time of day) a move happened, and the
/// confidence boost that earns. Moves minutes before the start are the
/// strongest signal; midday moves are mostly ticket-count noise.
fn move_time_boost(ts: DateTime<Utc>, commence: Option<DateTime<Utc>>) -> (f64, &'static str) {
    if let Some(ct) = commence {
        let mins_to_start = (ct - ts).num_seconds() as f64 / 60.0;
        if mins_to_start > 0.0 && mins_to_start <= 15.0 {
            return (1.0, "moved inside 15 minutes of start");
        }
        if mins_to_start > 0.0 && mins_to_start <= 60.0 {
            return (0.7, "moved inside an hour of start");
        }
    }
    match ts.hour() {
        0..=7 => (0.8, "early-hours move"),
        8..=19 => (0.3, "midday move"),
        _ => (0.5, "evening move"),
    }
}

/// Combine the movement's features into a grade plus human-readable reasons
/// for the alert body.
pub fn grade_signal(
    lm: &LineMovement,
    liquidity_usd: f64,
    commence: Option<DateTime<Utc>>,
    sources_moved: usize,
    rlm_min_liquidity: f64,
) -> (Grade, Vec<String>) {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if lm.is_rlm {
        score += 3.0;
        reasons.push("reverse line movement at the sharp book".to_string());
    }
    if lm.is_steam {
        score += 2.0;
        reasons.push(format!("steam across {} sources", sources_moved.max(2)));
    }

    if liquidity_usd >= rlm_min_liquidity {
        score += 2.0;
        reasons.push(format!("high liquidity (${liquidity_usd:.0})"));
    } else if liquidity_usd >= 5_000.0 {
        score += 1.0;
        reasons.push(format!("medium liquidity (${liquidity_usd:.0})"));
    } else if liquidity_usd > 0.0 {
        score -= 1.0;
        reasons.push(format!("thin liquidity (${liquidity_usd:.0})"));
    }

    let (boost, timing) = move_time_boost(lm.ts, commence);
    score += boost * 2.0;
    reasons.push(timing.to_string());

    if is_focus_sport(&lm.sport) {
        score += 0.5;
        reasons.push("sharp-money focus market".to_string());
    }

    let abs_pct = lm.pct_change.abs().to_f64().unwrap_or(0.0);
    if abs_pct >= 0.15 {
        score += 1.0;
        reasons.push(format!("large move ({:.1}%)", abs_pct * 100.0));
    } else if abs_pct >= 0.10 {
        score += 0.5;
    }

    let grade = if score >= 6.0 {
        Grade::A
    } else if score >= 3.5 {
        Grade::B
    } else {
        Grade::C
    };
    (grade, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn observe_simple(
        tracker: &mut SignalTracker,
        source: SourceId,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<LineMovement> {
        tracker.observe(
            "Lakers vs Celtics",
            "basketball_nba",
            "Los Angeles Lakers",
            source,
            source.as_str(),
            price,
            dec!(0.05),
            SourceId::Pinnacle,
            now,
        )
    }

    #[test]
    fn test_first_observation_emits_nothing() {
        let mut tracker = SignalTracker::new();
        assert!(observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.0), Utc::now()).is_none());
    }

    #[test]
    fn test_small_move_below_threshold_ignored() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), now);
        assert!(observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.05), now).is_none());
    }

    #[test]
    fn test_sharp_drop_is_rlm() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), now);
        let lm = observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.88), now).unwrap();
        assert!(lm.is_rlm);
        assert_eq!(lm.direction, MoveDirection::Down);
        assert!(!lm.is_steam); // only one source moved
    }

    #[test]
    fn test_soft_book_drop_is_not_rlm() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Dafabet, dec!(2.00), now);
        let lm = observe_simple(&mut tracker, SourceId::Dafabet, dec!(1.80), now).unwrap();
        assert!(!lm.is_rlm);
    }

    #[test]
    fn test_steam_needs_two_distinct_sources() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), now);
        observe_simple(&mut tracker, SourceId::OneXBet, dec!(2.00), now);

        let lm1 = observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.85), now).unwrap();
        assert!(!lm1.is_steam);
        let lm2 = observe_simple(&mut tracker, SourceId::OneXBet, dec!(1.85), now).unwrap();
        assert!(lm2.is_steam);
    }

    #[test]
    fn test_same_source_twice_is_not_steam() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), now);
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.85), now);
        let lm = observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.70), now).unwrap();
        assert!(!lm.is_steam);
    }

    #[test]
    fn test_steam_window_expires() {
        let mut tracker = SignalTracker::new();
        let t0 = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), t0);
        observe_simple(&mut tracker, SourceId::OneXBet, dec!(2.00), t0);
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.85), t0);

        // Second source moves 10 minutes later; the first mover has aged out
        let t1 = t0 + Duration::seconds(600);
        let lm = observe_simple(&mut tracker, SourceId::OneXBet, dec!(1.85), t1).unwrap();
        assert!(!lm.is_steam);
    }

    #[test]
    fn test_opposite_directions_do_not_steam() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(2.00), now);
        observe_simple(&mut tracker, SourceId::OneXBet, dec!(2.00), now);
        observe_simple(&mut tracker, SourceId::Pinnacle, dec!(1.85), now);
        let lm = observe_simple(&mut tracker, SourceId::OneXBet, dec!(2.20), now).unwrap();
        assert!(!lm.is_steam);
    }

    #[test]
    fn test_rlm_plus_steam_near_kickoff_grades_a() {
        // RLM (+3) + steam (+2) + pre-match ≤15min (+2) → score 7 → A
        let now = Utc::now();
        let lm = LineMovement {
            event: "Arsenal vs Chelsea".into(),
            sport: "soccer_epl".into(),
            source: "Pinnacle".into(),
            outcome: "Arsenal".into(),
            price_before: dec!(2.00),
            price_after: dec!(1.88),
            pct_change: dec!(-0.06),
            direction: MoveDirection::Down,
            is_steam: true,
            is_rlm: true,
            ts: now,
        };
        let commence = Some(now + Duration::minutes(10));
        let (grade, reasons) = grade_signal(&lm, 0.0, commence, 3, 10_000.0);
        assert_eq!(grade, Grade::A);
        assert!(reasons.iter().any(|r| r.contains("reverse line movement")));
    }

    #[test]
    fn test_plain_move_grades_c() {
        let lm = LineMovement {
            event: "A vs B".into(),
            sport: "soccer_epl".into(),
            source: "Dafabet".into(),
            outcome: "A".into(),
            price_before: dec!(2.00),
            price_after: dec!(2.12),
            pct_change: dec!(0.06),
            direction: MoveDirection::Up,
            is_steam: false,
            is_rlm: false,
            ts: Utc::now().date_naive().and_hms_opt(12, 0, 0).unwrap().and_utc(),
        };
        let (grade, _) = grade_signal(&lm, 0.0, None, 1, 10_000.0);
        assert_eq!(grade, Grade::C);
    }

    #[test]
    fn test_thin_liquidity_penalized() {
        let lm = LineMovement {
            event: "A vs B".into(),
            sport: "basketball_nba".into(),
            source: "Pinnacle".into(),
            outcome: "A".into(),
            price_before: dec!(2.00),
            price_after: dec!(1.88),
            pct_change: dec!(-0.06),
            direction: MoveDirection::Down,
            is_steam: false,
            is_rlm: true,
            ts: Utc::now(),
        };
        let (with_liq, _) = grade_signal(&lm, 50_000.0, None, 1, 10_000.0);
        let (thin, _) = grade_signal(&lm, 500.0, None, 1, 10_000.0);
        // Same movement, worse liquidity → never a better grade
        assert!(matches!(
            (with_liq, thin),
            (Grade::A, Grade::B) | (Grade::A, Grade::C) | (Grade::B, Grade::C) | (Grade::A, Grade::A) | (Grade::B, Grade::B)
        ));
    }

    #[test]
    fn test_trim_bounds_history() {
        let mut tracker = SignalTracker::new();
        let now = Utc::now();
        for i in 0..600 {
            tracker.observe(
                &format!("event {i}"),
                "basketball_nba",
                "Home",
                SourceId::Pinnacle,
                "Pinnacle",
                dec!(2.0),
                dec!(0.05),
                SourceId::Pinnacle,
                now,
            );
        }
        tracker.trim(now, 500);
        assert!(tracker.last_price.len() <= 500);
    }
}
