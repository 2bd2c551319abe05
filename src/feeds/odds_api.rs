//! Client for the odds/scores feed (The Odds API shape).
//!
//! Quotes arrive as events carrying per-bookmaker, per-market outcome
//! prices; results arrive as completed events with per-participant scores.
//! Both endpoints report the remaining request quota in a response header,
//! which the engine tracks for its quota circuit-breaker.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

/// One fixture with prices from every configured bookmaker.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    #[serde(default)]
    pub bookmakers: Vec<RawBookmaker>,
}

impl RawEvent {
    pub fn name(&self) -> String {
        format!(
            "{} vs {}",
            self.home_team.as_deref().unwrap_or(""),
            self.away_team.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBookmaker {
    #[serde(default)]
    pub key: String,
    pub title: Option<String>,
    #[serde(default)]
    pub markets: Vec<RawMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMarket {
    #[serde(default)]
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: Vec<RawOutcome>,
}

/// A single quoted outcome. Fields are optional so one malformed outcome
/// never sinks the rest of the event.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOutcome {
    pub name: Option<String>,
    pub price: Option<Decimal>,
}

/// A finished (or in-play) fixture from the scores endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawResult {
    #[serde(default)]
    pub id: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub scores: Option<Vec<RawScore>>,
}

/// Per-participant score. The feed encodes scores as strings because some
/// sports report set lines ("6-4 7-5") or method-of-victory text.
#[derive(Debug, Clone, Deserialize)]
pub struct RawScore {
    #[serde(default)]
    pub name: String,
    pub score: Option<String>,
}

#[derive(Clone)]
pub struct OddsApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    regions: String,
    bookmakers: String,
}

impl OddsApiClient {
    pub fn new(base_url: &str, api_key: &str, bookmakers: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(OddsApiClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            regions: "eu,uk,au".to_string(),
            bookmakers: bookmakers.to_string(),
        })
    }

    /// Fetch head-to-head odds for one sport. Returns the events plus the
    /// remaining API quota if the feed reported it. A feed failure returns
    /// an empty list so the cycle continues with the other sports.
    pub async fn fetch_odds(&self, sport: &str) -> (Vec<RawEvent>, Option<i64>) {
        let url = format!("{}/v4/sports/{}/odds", self.base_url, sport);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("regions", self.regions.as_str()),
                ("markets", "h2h"),
                ("oddsFormat", "decimal"),
                ("bookmakers", self.bookmakers.as_str()),
            ])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!("odds fetch failed for {}: {}", sport, e);
                return (vec![], None);
            }
        };

        let remaining = quota_header(&resp);
        match resp.json::<Vec<RawEvent>>().await {
            Ok(events) => {
                debug!("odds {}: {} events, quota={:?}", sport, events.len(), remaining);
                (events, remaining)
            }
            Err(e) => {
                warn!("odds parse failed for {}: {}", sport, e);
                (vec![], remaining)
            }
        }
    }

    /// Fetch final scores for one sport, looking back three days.
    pub async fn fetch_scores(&self, sport: &str) -> (Vec<RawResult>, Option<i64>) {
        let url = format!("{}/v4/sports/{}/scores", self.base_url, sport);
        let resp = self
            .http
            .get(&url)
            .query(&[("apiKey", self.api_key.as_str()), ("daysFrom", "3")])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!("scores fetch failed for {}: {}", sport, e);
                return (vec![], None);
            }
        };

        let remaining = quota_header(&resp);
        match resp.json::<Vec<RawResult>>().await {
            Ok(results) => (results, remaining),
            Err(e) => {
                warn!("scores parse failed for {}: {}", sport, e);
                (vec![], remaining)
            }
        }
    }
}

fn quota_header(resp: &reqwest::Response) -> Option<i64> {
    resp.headers()
        .get("x-requests-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserialization_tolerates_missing_fields() {
        let json = r#"{
            "id": "abc",
            "commence_time": "2026-03-01T18:00:00Z",
            "home_team": "Arsenal",
            "away_team": "Chelsea",
            "bookmakers": [{
                "key": "pinnacle",
                "title": "Pinnacle",
                "markets": [{
                    "key": "h2h",
                    "outcomes": [
                        {"name": "Arsenal", "price": 2.10},
                        {"name": "Chelsea"},
                        {"price": 3.2}
                    ]
                }]
            }]
        }"#;
        let ev: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.name(), "Arsenal vs Chelsea");
        let outcomes = &ev.bookmakers[0].markets[0].outcomes;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].price.is_some());
        assert!(outcomes[1].price.is_none()); // missing price tolerated
        assert!(outcomes[2].name.is_none()); // missing name tolerated
    }

    #[test]
    fn test_result_deserialization() {
        let json = r#"{
            "id": "xyz",
            "completed": true,
            "home_team": "Lakers",
            "away_team": "Celtics",
            "scores": [
                {"name": "Lakers", "score": "112"},
                {"name": "Celtics", "score": "104"}
            ]
        }"#;
        let res: RawResult = serde_json::from_str(json).unwrap();
        assert!(res.completed);
        assert_eq!(res.scores.as_ref().unwrap().len(), 2);
    }
}
