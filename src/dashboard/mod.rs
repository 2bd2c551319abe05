//! Status dashboard and operator command surface.
//!
//! Read endpoints snapshot the shared engine state under its mutex; command
//! endpoints (control, confirm/reject, manual settle) call straight into
//! the engine. Everything except `/health` honors an optional bearer/query
//! token.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::db::models::TradeStatus;
use crate::engine::settlement::ManualOutcome;
use crate::engine::ArbEngine;

/// `/api/stats` is recomputed at most this often.
const STATS_CACHE_SECS: u64 = 15;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ArbEngine>,
    /// When set, API requests must carry it as a bearer token or `?token=`.
    pub token: Option<String>,
    stats_cache: Arc<Mutex<Option<(Instant, serde_json::Value)>>>,
}

impl AppState {
    pub fn new(engine: Arc<ArbEngine>, token: Option<String>) -> Self {
        AppState {
            engine,
            token,
            stats_cache: Arc::new(Mutex::new(None)),
        }
    }
}

/// Build the Axum router for the dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/state", get(state_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/control", post(control_handler))
        .route("/api/confirm", post(confirm_handler))
        .route("/api/reject", post(reject_handler))
        .route("/api/settle", post(settle_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn authorized(state: &AppState, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    let Some(token) = &state.token else {
        return true;
    };
    let bearer_ok = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {token}"))
        .unwrap_or(false);
    bearer_ok || query.get("token") == Some(token)
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
}

async fn index_handler() -> impl IntoResponse {
    Html(DASHBOARD_HTML)
}

/// GET /health (unauthenticated liveness probe)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let s = state.engine.state().lock().unwrap();
    Json(json!({
        "status": "ok",
        "auto_scan": s.settings.auto_scan,
        "scan_count": s.scan_count,
        "last_scan": s.last_scan_time,
        "pending": s.pending.len(),
        "api_remaining": s.api_remaining,
        "trades": s.trade_records.len(),
    }))
}

/// GET /api/state: full operational snapshot.
async fn state_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    let s = state.engine.state().lock().unwrap();

    let confirmed: Vec<_> = s
        .trade_records
        .iter()
        .filter(|t| t.status == TradeStatus::Confirmed)
        .collect();
    let rejected = s
        .trade_records
        .iter()
        .filter(|t| t.status == TradeStatus::Rejected)
        .count();
    let est_profit: f64 = confirmed
        .iter()
        .map(|t| t.profit_pct.to_f64().unwrap_or(0.0) * t.total_staked() as f64)
        .sum();

    let mut clv_values = Vec::new();
    for t in &confirmed {
        let (c1, c2) = crate::engine::clv::calc_clv(&s.closing_prices, t);
        clv_values.extend(c1);
        clv_values.extend(c2);
    }
    let avg_clv = (!clv_values.is_empty())
        .then(|| clv_values.iter().sum::<f64>() / clv_values.len() as f64);

    let recent_trades: Vec<_> = s.trade_records.iter().rev().take(30).collect();
    let unsettled: Vec<_> = confirmed
        .iter()
        .filter(|t| !t.is_settled())
        .map(|t| {
            json!({
                "signal_id": t.signal_id,
                "event": t.event,
                "leg1_source": t.leg1_source,
                "leg2_source": t.leg2_source,
                "profit_pct": t.profit_pct,
                "stake1": t.stake1,
                "stake2": t.stake2,
                "commence_time": t.commence_time,
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "auto_scan": s.settings.auto_scan,
            "scan_count": s.scan_count,
            "last_scan_time": s.last_scan_time,
            "pending_count": s.pending.len(),
            "api_remaining": s.api_remaining,
            "quota_warn_at": s.settings.quota_warn_at,
            "min_profit": s.settings.min_profit,
            "min_price": s.settings.min_price,
            "max_price": s.settings.max_price,
            "scan_interval": s.settings.scan_interval_secs,
            "use_kelly": s.settings.use_kelly,
            "opportunities": s.opportunity_log.iter().rev().take(50).collect::<Vec<_>>(),
            "line_movements": s.line_movements.iter().rev().take(50).collect::<Vec<_>>(),
            "trade_records": recent_trades,
            "unsettled_trades": unsettled,
            "pnl": {
                "confirmed": confirmed.len(),
                "rejected": rejected,
                "est_profit": est_profit.round(),
                "avg_clv": avg_clv,
            },
        })),
    )
}

/// GET /api/stats: analytical aggregates, cached briefly.
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    {
        let cache = state.stats_cache.lock().unwrap();
        if let Some((at, cached)) = cache.as_ref() {
            if at.elapsed().as_secs() < STATS_CACHE_SECS {
                return (StatusCode::OK, Json(cached.clone()));
            }
        }
    }
    let stats = compute_stats(&state.engine);
    *state.stats_cache.lock().unwrap() = Some((Instant::now(), stats.clone()));
    (StatusCode::OK, Json(stats))
}

fn compute_stats(engine: &ArbEngine) -> serde_json::Value {
    let s = engine.state().lock().unwrap();

    let confirmed: Vec<_> = s
        .trade_records
        .iter()
        .filter(|t| t.status == TradeStatus::Confirmed)
        .collect();
    let rejected = s
        .trade_records
        .iter()
        .filter(|t| t.status == TradeStatus::Rejected)
        .count();
    let rlm_moves: Vec<_> = s.line_movements.iter().filter(|m| m.is_rlm).collect();
    let steam_moves: Vec<_> = s.line_movements.iter().filter(|m| m.is_steam).collect();

    // A signal "won" when a confirmed trade on the same event followed it
    // within half an hour.
    let signal_win_rate = |moves: &[&crate::db::models::LineMovement]| -> Option<f64> {
        if moves.is_empty() || confirmed.is_empty() {
            return None;
        }
        let mut wins = 0usize;
        let mut total = 0usize;
        for m in moves {
            for t in &confirmed {
                let dt = (t.created_at - m.ts).num_seconds().abs();
                if dt < 1800 && (m.event.contains(&t.event) || t.event.contains(&m.event)) {
                    total += 1;
                    wins += 1;
                    break;
                }
            }
        }
        (total > 0).then(|| wins as f64 / total as f64 * 100.0)
    };

    let sharp_count = rlm_moves.len() + steam_moves.len();
    let public_count = s.line_movements.len().saturating_sub(sharp_count);

    // Per-source sharpness proxy: how often a source's moves were
    // meaningful shortenings.
    let mut source_moves: HashMap<&str, (usize, usize)> = HashMap::new();
    for m in &s.line_movements {
        let entry = source_moves.entry(m.source.as_str()).or_default();
        entry.1 += 1;
        if m.pct_change.to_f64().unwrap_or(0.0) < -0.03 {
            entry.0 += 1;
        }
    }
    let source_accuracy: HashMap<&str, f64> = source_moves
        .into_iter()
        .filter(|(_, (_, total))| *total >= 3)
        .map(|(src, (sharp, total))| (src, sharp as f64 / total as f64))
        .collect();

    let mut sport_profit: HashMap<&str, f64> = HashMap::new();
    let mut sport_stake: HashMap<&str, f64> = HashMap::new();
    for t in &confirmed {
        let staked = t.total_staked() as f64;
        *sport_profit.entry(t.sport.as_str()).or_default() +=
            t.profit_pct.to_f64().unwrap_or(0.0) * staked;
        *sport_stake.entry(t.sport.as_str()).or_default() += staked;
    }
    let roi_by_sport: HashMap<&str, f64> = sport_stake
        .iter()
        .filter(|(_, stake)| **stake > 0.0)
        .map(|(sport, stake)| (*sport, sport_profit.get(sport).copied().unwrap_or(0.0) / stake))
        .collect();

    let mut clv_values = Vec::new();
    for t in &confirmed {
        let (c1, c2) = crate::engine::clv::calc_clv(&s.closing_prices, t);
        clv_values.extend(c1);
        clv_values.extend(c2);
    }
    let avg_clv = (!clv_values.is_empty())
        .then(|| clv_values.iter().sum::<f64>() / clv_values.len() as f64);
    let best_clv = clv_values.iter().cloned().fold(None, |best: Option<f64>, v| {
        Some(best.map_or(v, |b| b.max(v)))
    });

    let arb_total = confirmed.len() + rejected;
    let settled: Vec<_> = confirmed.iter().filter(|t| t.is_settled()).collect();
    let actual_profit: i64 = settled.iter().filter_map(|t| t.realized_profit).sum();

    json!({
        "rlm_win_rate": signal_win_rate(&rlm_moves),
        "rlm_count": rlm_moves.len(),
        "steam_win_rate": signal_win_rate(&steam_moves),
        "steam_count": steam_moves.len(),
        "arb_confirm_rate": (arb_total > 0)
            .then(|| confirmed.len() as f64 / arb_total as f64 * 100.0),
        "confirmed_trades": confirmed.len(),
        "settled_trades": settled.len(),
        "actual_profit": actual_profit,
        "sharp_count": sharp_count,
        "public_count": public_count,
        "source_accuracy": source_accuracy,
        "roi_by_sport": roi_by_sport,
        "clv": {
            "avg": avg_clv,
            "positive": clv_values.iter().filter(|c| **c > 0.0).count(),
            "negative": clv_values.iter().filter(|c| **c < 0.0).count(),
            "best": best_clv,
        },
    })
}

#[derive(Debug, Deserialize)]
struct ControlBody {
    key: String,
    value: serde_json::Value,
}

/// POST /api/control: apply a runtime setting change.
async fn control_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<ControlBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    let value = match &body.value {
        serde_json::Value::String(v) => v.clone(),
        other => other.to_string(),
    };
    match state.engine.apply_control(&body.key, &value) {
        Ok(msg) => (StatusCode::OK, Json(json!({"ok": true, "msg": msg}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "msg": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    signal_id: String,
}

/// POST /api/confirm: run the execution guard for a pending opportunity.
async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    match state.engine.confirm(&body.signal_id).await {
        Ok(confirmation) => (
            StatusCode::OK,
            Json(json!({"ok": true, "confirmation": confirmation})),
        ),
        Err(abort) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "abort": abort.to_string()})),
        ),
    }
}

/// POST /api/reject: discard a pending opportunity.
async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    match state.engine.reject(&body.signal_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(abort) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "abort": abort.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct SettleBody {
    signal_id: String,
    result: String,
}

/// POST /api/settle: manual settlement with an explicit outcome.
async fn settle_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SettleBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query) {
        return unauthorized();
    }
    let Some(outcome) = ManualOutcome::parse(&body.result) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "msg": "result must be leg1 / leg2 / draw / void"})),
        );
    };
    match state.engine.manual_settle(&body.signal_id, outcome).await {
        Ok(profit) => (
            StatusCode::OK,
            Json(json!({"ok": true, "realized_profit": profit, "settled_at": Utc::now()})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "msg": e.to_string()})),
        ),
    }
}

/// Embedded single-file dashboard (HTML + CSS + JS)
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Arbhawk Dashboard</title>
<style>
  :root {
    --bg: #0f1117;
    --card: #1a1d27;
    --border: #2a2d3a;
    --accent: #6c63ff;
    --green: #00c896;
    --red: #ff4f6a;
    --text: #e0e0e0;
    --muted: #8888aa;
  }
  * { box-sizing: border-box; margin: 0; padding: 0; }
  body { background: var(--bg); color: var(--text); font-family: 'Segoe UI', system-ui, sans-serif; }
  header { display: flex; align-items: center; gap: 1rem; padding: 1rem 2rem; border-bottom: 1px solid var(--border); }
  header h1 { font-size: 1.4rem; font-weight: 700; }
  main { padding: 1.5rem 2rem; display: grid; gap: 1.5rem; }
  .stats-grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(180px, 1fr)); gap: 1rem; }
  .stat-card { background: var(--card); border: 1px solid var(--border); border-radius: 10px; padding: 1.2rem; }
  .stat-card .label { color: var(--muted); font-size: .8rem; text-transform: uppercase; letter-spacing: .06em; margin-bottom: .4rem; }
  .stat-card .value { font-size: 1.7rem; font-weight: 700; }
  .pos { color: var(--green); }
  .neg { color: var(--red); }
  .panel { background: var(--card); border: 1px solid var(--border); border-radius: 10px; overflow: hidden; }
  .panel-header { padding: .9rem 1.2rem; border-bottom: 1px solid var(--border); font-weight: 600; }
  table { width: 100%; border-collapse: collapse; }
  th { padding: .7rem 1rem; text-align: left; font-size: .75rem; text-transform: uppercase; color: var(--muted); border-bottom: 1px solid var(--border); }
  td { padding: .65rem 1rem; font-size: .88rem; border-bottom: 1px solid #1e2130; }
  tr:last-child td { border-bottom: none; }
  .empty { color: var(--muted); text-align: center; padding: 2rem; font-size: .9rem; }
</style>
</head>
<body>
<header>
  <h1>🦅 Arbhawk</h1>
  <span style="margin-left:auto;color:var(--muted);font-size:.8rem;" id="last-updated"></span>
</header>
<main>
  <div class="stats-grid" id="stats"></div>
  <div class="panel">
    <div class="panel-header">Opportunities</div>
    <table><thead><tr><th>Event</th><th>Profit</th><th>Leg 1</th><th>Leg 2</th><th>Status</th></tr></thead>
    <tbody id="opps"><tr><td colspan="5" class="empty">loading…</td></tr></tbody></table>
  </div>
  <div class="panel">
    <div class="panel-header">Line movements</div>
    <table><thead><tr><th>Event</th><th>Source</th><th>Outcome</th><th>Move</th><th>Flags</th></tr></thead>
    <tbody id="moves"><tr><td colspan="5" class="empty">loading…</td></tr></tbody></table>
  </div>
  <div class="panel">
    <div class="panel-header">Trades</div>
    <table><thead><tr><th>Event</th><th>Sources</th><th>Profit %</th><th>Stakes</th><th>Realized</th></tr></thead>
    <tbody id="trades"><tr><td colspan="5" class="empty">loading…</td></tr></tbody></table>
  </div>
</main>
<script>
const qs = new URLSearchParams(location.search);
const token = qs.get('token');
const suffix = token ? `?token=${token}` : '';

function stat(label, value, cls = '') {
  return `<div class="stat-card"><div class="label">${label}</div><div class="value ${cls}">${value}</div></div>`;
}

async function refresh() {
  const r = await fetch('/api/state' + suffix);
  if (!r.ok) return;
  const d = await r.json();
  document.getElementById('stats').innerHTML =
    stat('Auto scan', d.auto_scan ? 'ON' : 'OFF', d.auto_scan ? 'pos' : 'neg') +
    stat('Scans', d.scan_count) +
    stat('Pending', d.pending_count) +
    stat('Feed credits', d.api_remaining) +
    stat('Confirmed', d.pnl.confirmed) +
    stat('Est. profit', Math.round(d.pnl.est_profit), d.pnl.est_profit >= 0 ? 'pos' : 'neg') +
    stat('Avg CLV', d.pnl.avg_clv == null ? '—' : d.pnl.avg_clv.toFixed(2) + '%');

  document.getElementById('opps').innerHTML = d.opportunities.map(o =>
    `<tr><td>${o.event}</td><td>${(parseFloat(o.profit_pct) * 100).toFixed(2)}%</td>
     <td>${o.leg1_source} @ ${o.leg1_price}</td><td>${o.leg2_source} @ ${o.leg2_price}</td>
     <td>${o.status}</td></tr>`).join('') || '<tr><td colspan="5" class="empty">none yet</td></tr>';

  document.getElementById('moves').innerHTML = d.line_movements.map(m =>
    `<tr><td>${m.event}</td><td>${m.source}</td><td>${m.outcome}</td>
     <td class="${parseFloat(m.pct_change) < 0 ? 'neg' : 'pos'}">${m.price_before} → ${m.price_after}</td>
     <td>${m.is_steam ? '🌊' : ''}${m.is_rlm ? '🔄' : ''}</td></tr>`).join('')
    || '<tr><td colspan="5" class="empty">none yet</td></tr>';

  document.getElementById('trades').innerHTML = d.trade_records.map(t =>
    `<tr><td>${t.event}</td><td>${t.leg1_source} / ${t.leg2_source}</td>
     <td>${(parseFloat(t.profit_pct) * 100).toFixed(2)}%</td>
     <td>${t.stake1} + ${t.stake2}</td>
     <td class="${(t.realized_profit ?? 0) >= 0 ? 'pos' : 'neg'}">${t.realized_profit ?? '⏳'}</td></tr>`).join('')
    || '<tr><td colspan="5" class="empty">none yet</td></tr>';

  document.getElementById('last-updated').textContent = new Date().toLocaleTimeString();
}
refresh();
setInterval(refresh, 10000);
</script>
</body>
</html>
"#;
