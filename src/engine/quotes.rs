use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

/// A price source we can take a position at.
///
/// Feed payloads identify sources by free-form keys ("pinnacle", "onexbet",
/// "1xbet", ...). We resolve those to this enum once at ingestion so the
/// commission and stake-cap lookups downstream are typed map hits rather than
/// repeated substring scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Pinnacle,
    OneXBet,
    Dafabet,
    Polymarket,
    Other,
}

impl SourceId {
    pub fn from_key(key: &str) -> Self {
        let k = key.to_lowercase();
        if k.contains("pinnacle") {
            SourceId::Pinnacle
        } else if k.contains("onexbet") || k.contains("1xbet") {
            SourceId::OneXBet
        } else if k.contains("dafabet") {
            SourceId::Dafabet
        } else if k.contains("polymarket") {
            SourceId::Polymarket
        } else {
            SourceId::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Pinnacle => "pinnacle",
            SourceId::OneXBet => "1xbet",
            SourceId::Dafabet => "dafabet",
            SourceId::Polymarket => "polymarket",
            SourceId::Other => "other",
        }
    }
}

/// Per-source trading parameters.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Commission deducted from quoted prices (fraction, e.g. 0.02).
    pub commission: Decimal,
    /// Maximum stake per bet in display currency. Zero = uncapped.
    pub max_stake: Decimal,
}

pub type SourceMap = HashMap<SourceId, SourceConfig>;

/// A captured price for one outcome at one source.
///
/// Immutable once built; a newer fetch for the same (event, outcome, source)
/// simply supersedes it in the best-price table.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub source: SourceId,
    /// Display title from the feed ("Pinnacle", "1xBet", ...).
    pub source_name: String,
    pub outcome: String,
    /// Quoted decimal price before commission. Settlement accounting uses this.
    pub price_raw: Decimal,
    /// Price after the source's commission; detection uses this.
    pub price_eff: Decimal,
    pub last_update: Option<DateTime<Utc>>,
    /// Feed-side event reference, used for building bet instructions.
    pub event_ref: String,
    /// Prediction-market outcome token, when the source is one.
    pub token_id: Option<String>,
    pub market_url: Option<String>,
}

/// Deduct a source's commission from a raw price.
pub fn effective_price(raw: Decimal, commission: Decimal) -> Decimal {
    (raw * (Decimal::ONE - commission)).round_dp(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_source_resolution() {
        assert_eq!(SourceId::from_key("pinnacle"), SourceId::Pinnacle);
        assert_eq!(SourceId::from_key("onexbet"), SourceId::OneXBet);
        assert_eq!(SourceId::from_key("1xBet"), SourceId::OneXBet);
        assert_eq!(SourceId::from_key("Polymarket"), SourceId::Polymarket);
        assert_eq!(SourceId::from_key("betfair"), SourceId::Other);
    }

    #[test]
    fn test_effective_price_no_commission() {
        assert_eq!(effective_price(dec!(2.10), Decimal::ZERO), dec!(2.100));
    }

    #[test]
    fn test_effective_price_with_commission() {
        // 2% commission on 2.50 → 2.45
        assert_eq!(effective_price(dec!(2.50), dec!(0.02)), dec!(2.450));
    }
}
