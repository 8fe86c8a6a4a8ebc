// =============================================================================
// Central Application State — Borealis Perp Engine
// =============================================================================
//
// The constructor graph assembled in main. Every subsystem is owned here and
// passed downward; components depend on ports, never back on the engine.
// `AppState` also builds the `/status` snapshot for the control surface.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::Config;
use crate::exchange::stream::StreamHealth;
use crate::exchange::ExchangePort;
use crate::market_data::{LiveCache, MarketData};
use crate::ml::MlEnsemble;
use crate::news::{NewsPipeline, NewsStats};
use crate::notify::Notifier;
use crate::position::PositionManager;
use crate::risk::capital::CapitalSnapshot;
use crate::risk::{CapitalTracker, RiskGate, RiskState};
use crate::signal::{Signal, SignalEngine};
use crate::store::Store;
use crate::types::EngineMode;

pub struct AppState {
    pub config: Arc<Config>,

    // ── Ports & services ────────────────────────────────────────────────
    pub exchange: Arc<dyn ExchangePort>,
    pub live: Arc<LiveCache>,
    pub market_data: Arc<MarketData>,
    pub stream_health: Arc<StreamHealth>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<Notifier>,
    pub ml: Arc<MlEnsemble>,
    pub news: Arc<NewsPipeline>,

    // ── Trading core ────────────────────────────────────────────────────
    pub risk_gate: Arc<RiskGate>,
    pub capital: Arc<CapitalTracker>,
    pub positions: Arc<PositionManager>,
    pub signal_engine: SignalEngine,

    // ── Engine status ───────────────────────────────────────────────────
    pub mode: RwLock<EngineMode>,
    pub cycle_count: AtomicU64,
    pub last_signals: RwLock<Vec<Signal>>,
    pub last_balance: RwLock<f64>,
    pub started_at: Instant,
}

impl AppState {
    pub fn cycles(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn record_cycle(&self) {
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
    }

    /// `true` while any subsystem runs in a reduced mode: the stream on REST
    /// fallback, or an ML head failing while others carry the ensemble.
    pub fn is_degraded(&self) -> bool {
        if self.stream_health.is_degraded() {
            return true;
        }
        let heads = self.ml.head_summary();
        let trained = heads.iter().filter(|(_, trained, _)| *trained).count();
        trained > 0 && trained < heads.len()
    }

    /// Build the `/status` payload.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let balance = *self.last_balance.read();
        StatusSnapshot {
            mode: *self.mode.read(),
            degraded: self.is_degraded(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            cycles: self.cycles(),
            server_time: Utc::now().timestamp_millis(),
            paper_trading: self.config.paper_trading,
            symbols: self.config.symbols.clone(),
            stream: StreamStatus {
                connected: self.stream_health.is_connected(),
                degraded: self.stream_health.is_degraded(),
                reconnect_attempts: self
                    .stream_health
                    .reconnect_attempts
                    .load(Ordering::Relaxed),
            },
            prices: self
                .config
                .symbols
                .iter()
                .map(|s| (s.clone(), self.live.price_unchecked(s)))
                .collect(),
            risk: self.risk_gate.state(balance, &self.config.symbols),
            capital: self.capital.latest(),
            ml_heads: self
                .ml
                .head_summary()
                .into_iter()
                .map(|(name, trained, r2)| MlHeadStatus { name, trained, r2 })
                .collect(),
            news: self.news.stats(),
            signals: self.last_signals.read().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub degraded: bool,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MlHeadStatus {
    pub name: String,
    pub trained: bool,
    pub r2: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: EngineMode,
    pub degraded: bool,
    pub uptime_secs: u64,
    pub cycles: u64,
    pub server_time: i64,
    pub paper_trading: bool,
    pub symbols: Vec<String>,
    pub prices: Vec<(String, Option<f64>)>,
    pub stream: StreamStatus,
    pub risk: RiskState,
    pub capital: Option<CapitalSnapshot>,
    pub ml_heads: Vec<MlHeadStatus>,
    pub news: NewsStats,
    pub signals: Vec<Signal>,
}
