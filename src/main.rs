// =============================================================================
// Borealis Perp Engine — Main Entry Point
// =============================================================================
//
// The engine starts with the trading cycle STOPPED; trading begins only
// after an explicit POST /api/v1/start. Paper trading is the default until
// PAPER_TRADING=false and live credentials are configured.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod engine;
mod error;
mod exchange;
mod indicators;
mod market_data;
mod ml;
mod news;
mod notify;
mod position;
mod risk;
mod signal;
mod store;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::engine::Engine;
use crate::exchange::bitget::BitgetClient;
use crate::exchange::breaker::CircuitBreaker;
use crate::exchange::paper::PaperExchange;
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::stream::{MarketStream, StreamHealth};
use crate::exchange::ExchangePort;
use crate::market_data::{LiveCache, MarketData};
use crate::ml::MlEnsemble;
use crate::news::NewsPipeline;
use crate::notify::telegram::TelegramChannel;
use crate::notify::{LogChannel, Notifier, NotifyChannel};
use crate::position::PositionManager;
use crate::risk::{CapitalTracker, RiskGate};
use crate::signal::SignalEngine;
use crate::store::SqliteStore;
use crate::types::EngineMode;

/// Grace period for background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Perp Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration rejected — refusing to start");
            return Err(e.into());
        }
    };

    // ── 2. Ports & infrastructure ────────────────────────────────────────
    let store: Arc<dyn crate::store::Store> =
        Arc::new(SqliteStore::open(&config.database_path)?);

    let notifier = Notifier::new();
    let channel: Arc<dyn NotifyChannel> =
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat)) => {
                info!("telegram notifications enabled");
                Arc::new(TelegramChannel::new(token.clone(), chat.clone()))
            }
            _ => {
                info!("no telegram configured — notifications go to the log");
                Arc::new(LogChannel)
            }
        };

    let live = Arc::new(LiveCache::new());
    let limiter = Arc::new(RateLimiter::new());
    let breaker = Arc::new(CircuitBreaker::new());
    let rest_client = Arc::new(BitgetClient::new(
        config.credentials.clone(),
        &config.network,
        limiter,
        breaker,
        live.clone(),
    ));

    let exchange: Arc<dyn ExchangePort> = if config.paper_trading {
        Arc::new(PaperExchange::new(rest_client.clone(), live.clone()))
    } else {
        rest_client.clone()
    };

    let market_data = Arc::new(MarketData::new(exchange.clone(), live.clone()));
    let stream_health = Arc::new(StreamHealth::new());

    // ── 3. Intelligence ─────────────────────────────────────────────────
    let ml = Arc::new(MlEnsemble::new(&config.model_dir, config.ml_retrain_hours));
    if config.enable_ml_models {
        ml.load();
        let heads = ml.head_summary();
        let trained = heads.iter().filter(|(_, t, _)| *t).count();
        info!(trained, total = heads.len(), "ml models restored");
    }

    // Structured-sentiment port wiring is deployment-specific.
    let llm: Option<Arc<dyn crate::news::LlmPort>> = None;
    if config.use_llm_sentiment && llm.is_none() {
        warn!("USE_GPT_4 is set but no LLM port is wired — using the keyword scorer");
    }
    info!(
        cost_optimization = config.enable_cost_optimization,
        min_news_confidence = config.min_news_confidence,
        "news pipeline configured"
    );
    let news = Arc::new(NewsPipeline::new(
        crate::news::default_feeds(),
        store.clone(),
        llm,
        config.min_news_confidence,
        Duration::from_secs(config.network.http_timeout_secs),
    ));

    // ── 4. Trading core ──────────────────────────────────────────────────
    let risk_gate = Arc::new(RiskGate::new(&config, store.clone()));
    let capital = Arc::new(CapitalTracker::new(
        &config,
        exchange.clone(),
        store.clone(),
        notifier.clone(),
    ));
    let positions = Arc::new(PositionManager::new(
        &config,
        exchange.clone(),
        store.clone(),
        notifier.clone(),
    ));
    let signal_engine = SignalEngine::new(&config);

    let state = Arc::new(AppState {
        config: config.clone(),
        exchange: exchange.clone(),
        live: live.clone(),
        market_data,
        stream_health: stream_health.clone(),
        store: store.clone(),
        notifier: notifier.clone(),
        ml,
        news,
        risk_gate,
        capital: capital.clone(),
        positions: positions.clone(),
        signal_engine,
        mode: RwLock::new(EngineMode::Stopped),
        cycle_count: AtomicU64::new(0),
        last_signals: RwLock::new(Vec::new()),
        last_balance: RwLock::new(0.0),
        started_at: Instant::now(),
    });

    info!(
        symbols = ?config.symbols,
        paper_trading = config.paper_trading,
        mode = %EngineMode::Stopped,
        "engine assembled — start trading via POST /api/v1/start"
    );

    // ── 5. Background tasks ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Market stream (WS reader + health + REST fallback).
    {
        let stream = MarketStream::new(
            config.symbols.clone(),
            live.clone(),
            stream_health.clone(),
            config.network.clone(),
        );
        let rest: Arc<dyn ExchangePort> = rest_client.clone();
        tasks.push(tokio::spawn(stream.run(rest, shutdown_rx.clone())));
    }

    // Notifier worker.
    tasks.push(tokio::spawn(
        notifier.clone().run_worker(channel, shutdown_rx.clone()),
    ));

    // Capital tracker loop.
    {
        let positions_for_capital = positions.clone();
        tasks.push(tokio::spawn(capital.clone().run(
            move || positions_for_capital.open_positions(),
            shutdown_rx.clone(),
        )));
    }

    // ML retrainer + news verification.
    tasks.push(tokio::spawn(engine::run_ml_retrainer(
        state.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(engine::run_news_verification(
        state.clone(),
        shutdown_rx.clone(),
    )));

    // Control surface.
    {
        let api_state = state.clone();
        let bind_addr = config.bind_addr.clone();
        tasks.push(tokio::spawn(async move {
            let app = api::rest::router(api_state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "control API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "control API failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind control API"),
            }
        }));
    }

    // Engine cycle (the main trading loop).
    let engine_task = tokio::spawn(Engine::new(state.clone()).run(shutdown_rx.clone()));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Stop initiating new work; in-flight orders complete, positions stay.
    *state.mode.write() = EngineMode::Stopped;
    let _ = shutdown_tx.send(true);

    // Background tasks first, then the engine, each within the grace period.
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("background task exceeded shutdown grace — detaching");
        }
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, engine_task).await.is_err() {
        warn!("engine loop exceeded shutdown grace — detaching");
    }

    if let Err(e) = state.ml.save() {
        warn!(error = %e, "failed to persist models on shutdown");
    }

    info!("Borealis Perp Engine shut down complete.");
    Ok(())
}
