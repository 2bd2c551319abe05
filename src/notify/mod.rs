//! Structured alert payloads and the channel that delivers them.
//!
//! The engine does not know what sits on the other end of the notification
//! channel (a chat bot, a pager, a log file). It emits typed payloads
//! through the `Notifier` trait; confirm/reject decisions come back through
//! the dashboard's command API keyed by signal id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AlertLeg {
    pub source: String,
    pub outcome: String,
    pub price: Decimal,
    /// Display-currency stake.
    pub stake: i64,
    pub payout: i64,
}

/// How close to kickoff an opportunity alert lands. The closer to the
/// start, the closer the captured price is to the closing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// ≤ 30 minutes to start.
    ClosingSoon,
    /// ≤ 2 hours to start.
    Soon,
    Normal,
}

impl Urgency {
    pub fn from_mins_to_start(mins: Option<i64>) -> Self {
        match mins {
            Some(m) if m > 0 && m <= 30 => Urgency::ClosingSoon,
            Some(m) if m > 0 && m <= 120 => Urgency::Soon,
            _ => Urgency::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    OpportunityFound {
        signal_id: String,
        event: String,
        sport: String,
        profit_pct: Decimal,
        legs: Vec<AlertLeg>,
        total_stake: i64,
        mins_to_start: Option<i64>,
        urgency: Urgency,
        market_url: Option<String>,
        kelly_sized: bool,
    },
    LineMove {
        event: String,
        sport: String,
        source: String,
        outcome: String,
        price_before: Decimal,
        price_after: Decimal,
        pct_change: Decimal,
        grade: String,
        reasons: Vec<String>,
        is_steam: bool,
        is_rlm: bool,
    },
    SettlementResult {
        signal_id: String,
        event: String,
        winner: String,
        realized_profit: i64,
        total_staked: i64,
        roi_pct: f64,
    },
    ManualReviewRequired {
        signal_id: String,
        event: String,
        reason: String,
    },
    QuotaWarning {
        remaining: i64,
        critical: bool,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one alert. Failures are the implementation's problem to log;
    /// the engine never retries alerts.
    async fn send(&self, alert: &Alert);
}

/// Fallback notifier that writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) {
        match serde_json::to_string(alert) {
            Ok(json) => info!("alert: {}", json),
            Err(e) => warn!("alert serialization failed: {}", e),
        }
    }
}

/// Delivers alerts as JSON POSTs to a configured webhook.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(WebhookNotifier {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) {
        let result = self.http.post(&self.url).json(alert).send().await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!("webhook alert rejected: {}", resp.status());
            }
            Err(e) => warn!("webhook alert failed: {}", e),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urgency_buckets() {
        assert_eq!(Urgency::from_mins_to_start(Some(10)), Urgency::ClosingSoon);
        assert_eq!(Urgency::from_mins_to_start(Some(90)), Urgency::Soon);
        assert_eq!(Urgency::from_mins_to_start(Some(500)), Urgency::Normal);
        assert_eq!(Urgency::from_mins_to_start(Some(-5)), Urgency::Normal);
        assert_eq!(Urgency::from_mins_to_start(None), Urgency::Normal);
    }

    #[test]
    fn test_alert_serializes_with_type_tag() {
        let alert = Alert::QuotaWarning {
            remaining: 9,
            critical: true,
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "quota_warning");
        assert_eq!(json["remaining"], 9);
    }
}
