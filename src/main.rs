use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

mod config;
mod dashboard;
mod db;
mod engine;
mod feeds;
mod notify;

use config::Config;
use dashboard::AppState;
use db::Database;
use engine::{ArbEngine, EngineState, Settings};
use feeds::{OddsApiClient, PolymarketClient};
use notify::{LogNotifier, Notifier, WebhookNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let odds = OddsApiClient::new(&config.odds_api_url, &config.odds_api_key, &config.bookmakers)?;
    let markets = PolymarketClient::new(&config.polymarket_clob_url)?;

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => {
            info!("Alerts via webhook: {}", url);
            Arc::new(WebhookNotifier::new(url)?)
        }
        None => {
            info!("No webhook configured; alerts go to the log");
            Arc::new(LogNotifier)
        }
    };

    let sports = config.sports_list();
    info!(
        "Scanning {} sports every {}s | min profit {} | Kelly {} | alerts via {}",
        sports.len(),
        config.scan_interval_secs,
        config.min_profit,
        if config.use_kelly { "on" } else { "off" },
        notifier.name()
    );

    let state = EngineState::shared(Settings::from(&config));
    let engine = Arc::new(ArbEngine::new(state, db, odds, markets, notifier, sports));

    // Reload history and rebuild the settlement queue from the database
    engine.restore_from_db()?;

    // Independent loops: scanner, settlement sweep, closing-price watch
    tokio::spawn(Arc::clone(&engine).run_scanner());
    tokio::spawn(Arc::clone(&engine).run_settlement_sweep());
    tokio::spawn(Arc::clone(&engine).run_closing_watch());

    // Dashboard HTTP server (blocks until shutdown)
    let app = dashboard::router(AppState::new(
        Arc::clone(&engine),
        config.dashboard_token.clone(),
    ));
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
