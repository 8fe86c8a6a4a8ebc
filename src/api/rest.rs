// =============================================================================
// REST Control Surface — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid bearer token. CORS is permissive for development.
//
//   GET  /api/v1/status        engine status (+ degraded flag)
//   GET  /api/v1/positions     open positions
//   GET  /api/v1/performance   daily performance aggregates
//   GET  /api/v1/trades?limit= recent ledger entries
//   GET  /api/v1/balance       latest balance snapshot
//   POST /api/v1/start         resume the trading cycle
//   POST /api/v1/stop          pause the trading cycle
//   GET  /api/v1/ws            status push feed (query-param token)
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::EngineMode;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/performance", get(performance))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/balance", get(balance))
        .route("/api/v1/start", post(start))
        .route("/api/v1/stop", post(stop))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status_snapshot())
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.positions.open_positions())
}

async fn performance(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // Last 7 UTC days, newest first.
    let mut days = Vec::new();
    for back in 0..7 {
        let date = (Utc::now() - Duration::days(back))
            .format("%Y-%m-%d")
            .to_string();
        match state.store.get_daily_performance(&date) {
            Ok(Some(perf)) => days.push(serde_json::json!({
                "date": perf.date,
                "trades": perf.trades,
                "wins": perf.wins,
                "losses": perf.losses,
                "pnl": perf.pnl,
                "fees": perf.fees,
                "win_rate": perf.win_rate(),
            })),
            Ok(None) => {}
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        }
    }
    Json(serde_json::json!({ "days": days })).into_response()
}

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<u32>,
    symbol: Option<String>,
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.list_trades(query.symbol.as_deref(), limit) {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn balance(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.latest_balance() {
        Ok(Some(snapshot)) => Json(serde_json::json!({
            "total": snapshot.total,
            "available": snapshot.available,
            "taken_at": snapshot.taken_at,
        }))
        .into_response(),
        Ok(None) => Json(serde_json::json!({
            "total": *state.last_balance.read(),
            "available": null,
            "taken_at": null,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn start(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.mode.write() = EngineMode::Running;
    info!("trading started via control API");
    Json(serde_json::json!({ "mode": "Running" }))
}

async fn stop(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    *state.mode.write() = EngineMode::Stopped;
    info!("trading stopped via control API");
    Json(serde_json::json!({ "mode": "Stopped" }))
}
