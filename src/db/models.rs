use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Confirmed,
    Rejected,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Confirmed => "confirmed",
            TradeStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(TradeStatus::Confirmed),
            "rejected" => Some(TradeStatus::Rejected),
            _ => None,
        }
    }
}

/// A confirmed (or rejected) two-leg position.
///
/// Created by the execution guard at confirmation time. Only the settlement
/// engine (or a manual override) mutates it afterwards, by filling
/// `realized_profit` and `settled_at`; once those are set the record is
/// terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub signal_id: String,
    pub event: String,
    pub sport: String,
    pub leg1_source: String,
    pub leg2_source: String,
    pub leg1_outcome: String,
    pub leg2_outcome: String,
    /// Raw (pre-commission) prices; settlement accounting uses these.
    pub leg1_price: Decimal,
    pub leg2_price: Decimal,
    /// Stakes in display currency, whole units.
    pub stake1: i64,
    pub stake2: i64,
    pub profit_pct: Decimal,
    pub status: TradeStatus,
    pub clv_leg1: Option<f64>,
    pub clv_leg2: Option<f64>,
    /// Realized P&L in display currency once settled.
    pub realized_profit: Option<i64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub commence_time: Option<DateTime<Utc>>,
}

impl TradeRecord {
    pub fn total_staked(&self) -> i64 {
        self.stake1 + self.stake2
    }

    pub fn is_settled(&self) -> bool {
        self.realized_profit.is_some() || self.settled_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

impl MoveDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveDirection::Up => "up",
            MoveDirection::Down => "down",
        }
    }
}

/// A significant price change at one source for one outcome.
#[derive(Debug, Clone, Serialize)]
pub struct LineMovement {
    pub event: String,
    pub sport: String,
    pub source: String,
    pub outcome: String,
    pub price_before: Decimal,
    pub price_after: Decimal,
    /// Relative change, e.g. -0.06 for a 6% drop.
    pub pct_change: Decimal,
    pub direction: MoveDirection,
    /// Two or more distinct sources moved this outcome the same way within
    /// five minutes.
    pub is_steam: bool,
    /// The sharp reference book shortened this outcome beyond the threshold.
    pub is_rlm: bool,
    pub ts: DateTime<Utc>,
}

/// One row of the append-only opportunity log.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRow {
    pub id: String,
    pub event: String,
    pub sport: String,
    pub profit_pct: Decimal,
    pub leg1_source: String,
    pub leg1_price: Decimal,
    pub leg2_source: String,
    pub leg2_price: Decimal,
    pub stake1: i64,
    pub stake2: i64,
    pub created_at: DateTime<Utc>,
    /// "pending" | "confirmed" | "rejected"
    pub status: String,
}
