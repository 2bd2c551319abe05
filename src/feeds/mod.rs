pub mod odds_api;
pub mod polymarket;

pub use odds_api::OddsApiClient;
pub use polymarket::PolymarketClient;
