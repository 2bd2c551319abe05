use clap::Parser;
use rust_decimal::Decimal;

use crate::engine::quotes::{SourceConfig, SourceId, SourceMap};
use crate::engine::Settings;

/// Cross-book sports arbitrage scanner
#[derive(Parser, Debug, Clone)]
#[command(name = "arbhawk", version, about)]
pub struct Config {
    /// Odds feed API key
    #[arg(long, env = "ODDS_API_KEY", default_value = "")]
    pub odds_api_key: String,

    /// Odds feed base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com")]
    pub odds_api_url: String,

    /// Prediction-market CLOB base URL
    #[arg(
        long,
        env = "POLYMARKET_CLOB_URL",
        default_value = "https://clob.polymarket.com"
    )]
    pub polymarket_clob_url: String,

    /// Dashboard listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// Dashboard auth token (unset = open)
    #[arg(long, env = "DASHBOARD_TOKEN")]
    pub dashboard_token: Option<String>,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "arbhawk.db")]
    pub database_path: String,

    /// Webhook URL for alert delivery (unset = log alerts)
    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Comma-separated sport keys to scan
    #[arg(
        long,
        env = "SPORTS",
        default_value = "basketball_nba,basketball_euroleague,basketball_ncaab,americanfootball_nfl,soccer_epl,soccer_uefa_champs_league,soccer_spain_la_liga,soccer_germany_bundesliga,baseball_mlb,mma_mixed_martial_arts"
    )]
    pub sports: String,

    /// Comma-separated bookmaker keys requested from the odds feed
    #[arg(long, env = "BOOKMAKERS", default_value = "pinnacle,onexbet,dafabet")]
    pub bookmakers: String,

    /// Fixed total stake per opportunity in display currency (Kelly off)
    #[arg(long, env = "TOTAL_STAKE", default_value = "10000")]
    pub total_stake: Decimal,

    /// Display currency units per quote currency unit
    #[arg(long, env = "FX_RATE", default_value = "35")]
    pub fx_rate: Decimal,

    /// Minimum profit fraction to alert (e.g. 0.015 = 1.5%)
    #[arg(long, env = "MIN_PROFIT_PCT", default_value = "0.015")]
    pub min_profit: Decimal,

    /// Scan interval in seconds
    #[arg(long, env = "SCAN_INTERVAL", default_value = "300")]
    pub scan_interval_secs: u64,

    /// Start with auto-scan on
    #[arg(long, env = "AUTO_SCAN_START", default_value = "true")]
    pub auto_scan: bool,

    /// Warn once when feed credits drop to this level
    #[arg(long, env = "QUOTA_WARN_AT", default_value = "50")]
    pub quota_warn_at: i64,

    /// Fractional Kelly multiplier (0.0–1.0)
    #[arg(long, env = "KELLY_FRACTION", default_value = "0.25")]
    pub kelly_fraction: Decimal,

    /// Size stakes with fractional Kelly instead of the fixed total
    #[arg(long, env = "USE_KELLY", default_value = "true")]
    pub use_kelly: bool,

    /// Bankroll in display currency for Kelly sizing
    #[arg(long, env = "BANKROLL", default_value = "100000")]
    pub bankroll: Decimal,

    /// Kelly stake floor in display currency
    #[arg(long, env = "MIN_KELLY_STAKE", default_value = "10000")]
    pub min_kelly_stake: Decimal,

    /// Kelly stake ceiling in display currency
    #[arg(long, env = "MAX_KELLY_STAKE", default_value = "50000")]
    pub max_kelly_stake: Decimal,

    /// Quotes older than this many minutes are stale
    #[arg(long, env = "MAX_ODDS_AGE_MIN", default_value = "5")]
    pub max_quote_age_mins: i64,

    /// Lowest acceptable decimal price
    #[arg(long, env = "MIN_ODDS_ALLOWED", default_value = "1.05")]
    pub min_price: Decimal,

    /// Highest acceptable decimal price
    #[arg(long, env = "MAX_ODDS_ALLOWED", default_value = "15")]
    pub max_price: Decimal,

    /// Alert cooldown per (event, source-pair) in minutes
    #[arg(long, env = "ALERT_COOLDOWN_MIN", default_value = "30")]
    pub cooldown_mins: i64,

    /// Relative price change that counts as a line movement (0.05 = 5%)
    #[arg(long, env = "LINE_MOVE_THRESHOLD", default_value = "0.05")]
    pub line_move_threshold: Decimal,

    /// Prediction-market liquidity floor in USD
    #[arg(long, env = "POLY_MIN_LIQUIDITY", default_value = "1000")]
    pub poly_min_liquidity: f64,

    /// Liquidity above which RLM signals earn full weight (USD)
    #[arg(long, env = "RLM_MIN_LIQUIDITY_USD", default_value = "10000")]
    pub rlm_min_liquidity: f64,

    /// Scan sports in rotating batches of this size (0 = all each cycle)
    #[arg(long, env = "SPORT_ROTATION_SIZE", default_value = "0")]
    pub sport_rotation_size: usize,

    /// Prediction-market commission fraction
    #[arg(long, env = "FEE_POLYMARKET", default_value = "0.02")]
    pub fee_polymarket: Decimal,

    /// Pinnacle commission fraction
    #[arg(long, env = "FEE_PINNACLE", default_value = "0")]
    pub fee_pinnacle: Decimal,

    /// 1xBet commission fraction
    #[arg(long, env = "FEE_1XBET", default_value = "0")]
    pub fee_onexbet: Decimal,

    /// Dafabet commission fraction
    #[arg(long, env = "FEE_DAFABET", default_value = "0")]
    pub fee_dafabet: Decimal,

    /// Max stake at Pinnacle in display currency (0 = uncapped)
    #[arg(long, env = "MAX_STAKE_PINNACLE", default_value = "0")]
    pub max_stake_pinnacle: Decimal,

    /// Max stake at 1xBet in display currency (0 = uncapped)
    #[arg(long, env = "MAX_STAKE_1XBET", default_value = "0")]
    pub max_stake_onexbet: Decimal,

    /// Max stake at Dafabet in display currency (0 = uncapped)
    #[arg(long, env = "MAX_STAKE_DAFABET", default_value = "0")]
    pub max_stake_dafabet: Decimal,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.odds_api_key.is_empty() {
            anyhow::bail!("ODDS_API_KEY is required");
        }
        if !(Decimal::ZERO..=Decimal::ONE).contains(&self.kelly_fraction) {
            anyhow::bail!("kelly_fraction must be between 0.0 and 1.0");
        }
        if self.fx_rate <= Decimal::ZERO {
            anyhow::bail!("fx_rate must be positive");
        }
        if self.min_price >= self.max_price {
            anyhow::bail!("min_price must be below max_price");
        }
        if self.min_kelly_stake > self.max_kelly_stake {
            anyhow::bail!("min_kelly_stake must not exceed max_kelly_stake");
        }
        if self.min_profit < Decimal::ZERO {
            anyhow::bail!("min_profit must not be negative");
        }
        Ok(())
    }

    pub fn sports_list(&self) -> Vec<String> {
        self.sports
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn source_map(&self) -> SourceMap {
        let mut sources = SourceMap::new();
        sources.insert(
            SourceId::Polymarket,
            SourceConfig {
                commission: self.fee_polymarket,
                max_stake: Decimal::ZERO,
            },
        );
        sources.insert(
            SourceId::Pinnacle,
            SourceConfig {
                commission: self.fee_pinnacle,
                max_stake: self.max_stake_pinnacle,
            },
        );
        sources.insert(
            SourceId::OneXBet,
            SourceConfig {
                commission: self.fee_onexbet,
                max_stake: self.max_stake_onexbet,
            },
        );
        sources.insert(
            SourceId::Dafabet,
            SourceConfig {
                commission: self.fee_dafabet,
                max_stake: self.max_stake_dafabet,
            },
        );
        sources
    }
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Settings {
            auto_scan: cfg.auto_scan,
            min_profit: cfg.min_profit,
            scan_interval_secs: cfg.scan_interval_secs,
            min_price: cfg.min_price,
            max_price: cfg.max_price,
            cooldown_mins: cfg.cooldown_mins,
            max_quote_age_mins: cfg.max_quote_age_mins,
            total_stake: cfg.total_stake / cfg.fx_rate,
            fx_rate: cfg.fx_rate,
            use_kelly: cfg.use_kelly,
            kelly_fraction: cfg.kelly_fraction,
            bankroll: cfg.bankroll,
            min_kelly_stake: cfg.min_kelly_stake,
            max_kelly_stake: cfg.max_kelly_stake,
            line_move_threshold: cfg.line_move_threshold,
            quota_warn_at: cfg.quota_warn_at,
            poly_min_liquidity: cfg.poly_min_liquidity,
            rlm_min_liquidity: cfg.rlm_min_liquidity,
            sport_rotation_size: cfg.sport_rotation_size,
            sources: cfg.source_map(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> Config {
        Config::parse_from(["arbhawk", "--odds-api-key", "test-key"])
    }

    #[test]
    fn test_defaults_validate() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_kelly_fraction_bounds() {
        let mut cfg = base_config();
        cfg.kelly_fraction = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sports_list_parsing() {
        let mut cfg = base_config();
        cfg.sports = "basketball_nba, soccer_epl ,,".to_string();
        assert_eq!(cfg.sports_list(), vec!["basketball_nba", "soccer_epl"]);
    }

    #[test]
    fn test_settings_conversion() {
        let cfg = base_config();
        let settings = Settings::from(&cfg);
        // 10,000 display at fx 35 ≈ 285.71 quote
        assert_eq!(settings.total_stake, dec!(10000) / dec!(35));
        assert_eq!(
            settings.sources[&SourceId::Polymarket].commission,
            dec!(0.02)
        );
        assert_eq!(
            settings.sources[&SourceId::Pinnacle].commission,
            Decimal::ZERO
        );
    }
}
