//! Client for the prediction-market feed (Polymarket CLOB shape).
//!
//! Markets come back with a prose question, two outcome tokens priced as
//! implied probabilities, fee basis points, and volume figures we turn into
//! a daily-liquidity estimate that feeds the detector's impact-cost
//! discount.

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Markets with less recent volume than this are not worth quoting.
const MIN_VOLUME_USD: f64 = 500.0;
/// Cap on markets enriched per fetch, to bound feed latency.
const MAX_MARKETS: usize = 80;

#[derive(Debug, Clone)]
pub struct MarketOutcome {
    pub name: String,
    /// Implied probability (0–1).
    pub price: Decimal,
    pub token_id: String,
}

/// A binary prediction market ready for cross-source comparison.
#[derive(Debug, Clone)]
pub struct PredictionMarket {
    pub question: String,
    pub slug: String,
    pub outcomes: [MarketOutcome; 2],
    /// Taker+maker fee as a fraction (basis points / 10_000).
    pub fee_pct: Decimal,
    /// Estimated daily liquidity in USD.
    pub liquidity: f64,
    pub volume_24h: f64,
}

impl PredictionMarket {
    pub fn url(&self) -> String {
        format!("https://polymarket.com/event/{}", self.slug)
    }
}

#[derive(Clone)]
pub struct PolymarketClient {
    http: Client,
    clob_url: String,
}

impl PolymarketClient {
    pub fn new(clob_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(PolymarketClient {
            http,
            clob_url: clob_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch active sports markets, enriched with fee and liquidity.
    /// Returns an empty list on any feed failure.
    pub async fn fetch_markets(&self) -> Vec<PredictionMarket> {
        let mut raw = match self.fetch_raw(&[("tag_slug", "sports")]).await {
            Ok(m) => m,
            Err(e) => {
                debug!("market fetch (sports tag) failed: {}", e);
                vec![]
            }
        };
        if raw.is_empty() {
            // tag filter sometimes returns nothing; fall back to everything
            raw = self.fetch_raw(&[]).await.unwrap_or_default();
        }

        let total = raw.len();
        let markets: Vec<PredictionMarket> = raw
            .into_iter()
            .take(MAX_MARKETS)
            .filter_map(|item| parse_market(&item))
            .collect();
        info!(
            "prediction markets: {} fetched, {} quotable",
            total,
            markets.len()
        );
        markets
    }

    async fn fetch_raw(&self, extra: &[(&str, &str)]) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/markets", self.clob_url);
        let mut query: Vec<(&str, &str)> = vec![("active", "true"), ("closed", "false")];
        query.extend_from_slice(extra);

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("market feed request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("market feed error: {}", resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("market feed parse failed")?;
        Ok(raw["data"].as_array().cloned().unwrap_or_default())
    }
}

fn json_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn parse_market(item: &serde_json::Value) -> Option<PredictionMarket> {
    let tokens = item["tokens"].as_array()?;
    if tokens.len() < 2 {
        return None;
    }

    let maker_fee = json_f64(&item["maker_base_fee"]).unwrap_or(0.0);
    let taker_fee = json_f64(&item["taker_base_fee"]).unwrap_or(200.0);
    let fee_pct = Decimal::from_f64((maker_fee + taker_fee) / 10_000.0)?;

    let volume_24h = json_f64(&item["volume_num_24hr"]).unwrap_or(0.0);
    let total_volume = json_f64(&item["volume"]).unwrap_or(0.0);
    if volume_24h < MIN_VOLUME_USD && total_volume < MIN_VOLUME_USD * 10.0 {
        return None;
    }

    let outcome = |idx: usize| -> Option<MarketOutcome> {
        let t = &tokens[idx];
        let price = json_f64(&t["price"])?;
        // implied probability at or under 1% means >100x odds, not a real quote
        if price <= 0.01 {
            return None;
        }
        Some(MarketOutcome {
            name: t["outcome"].as_str().unwrap_or("").to_string(),
            price: Decimal::from_f64(price)?,
            token_id: t["token_id"].as_str().unwrap_or("").to_string(),
        })
    };

    Some(PredictionMarket {
        question: item["question"].as_str().unwrap_or("").to_string(),
        slug: item["market_slug"]
            .as_str()
            .or_else(|| item["slug"].as_str())
            .unwrap_or("")
            .to_string(),
        outcomes: [outcome(0)?, outcome(1)?],
        fee_pct,
        liquidity: volume_24h.min(total_volume / 30.0),
        volume_24h,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn market_json(price_a: f64, price_b: f64, volume_24h: f64) -> serde_json::Value {
        json!({
            "question": "Will Arsenal beat Chelsea?",
            "market_slug": "arsenal-chelsea",
            "taker_base_fee": 200,
            "maker_base_fee": 0,
            "volume_num_24hr": volume_24h,
            "volume": volume_24h * 40.0,
            "tokens": [
                {"outcome": "Arsenal", "price": price_a, "token_id": "t1"},
                {"outcome": "Chelsea", "price": price_b, "token_id": "t2"}
            ]
        })
    }

    #[test]
    fn test_parse_market() {
        let m = parse_market(&market_json(0.45, 0.55, 20_000.0)).unwrap();
        assert_eq!(m.question, "Will Arsenal beat Chelsea?");
        assert_eq!(m.outcomes[0].name, "Arsenal");
        // 200 bps → 2%
        let fee_err = (m.fee_pct - rust_decimal_macros::dec!(0.02)).abs();
        assert!(fee_err < rust_decimal_macros::dec!(0.0001));
        assert!(m.liquidity > 0.0);
    }

    #[test]
    fn test_low_volume_market_filtered() {
        assert!(parse_market(&market_json(0.45, 0.55, 10.0)).is_none());
    }

    #[test]
    fn test_extreme_price_filtered() {
        // 0.5% implied probability is a >100x long shot, not a usable quote
        assert!(parse_market(&market_json(0.005, 0.995, 20_000.0)).is_none());
    }

    #[test]
    fn test_missing_tokens_rejected() {
        let item = json!({"question": "?", "tokens": [{"outcome": "A", "price": 0.5}]});
        assert!(parse_market(&item).is_none());
    }
}
