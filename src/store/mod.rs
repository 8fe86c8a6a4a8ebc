// =============================================================================
// Store — typed DAO surface over the durable records
// =============================================================================
//
// The Store owns positions, trades, balances, predictions, news, daily
// performance, Kelly statistics, and the system event log. Everything else
// holds only in-memory caches that reconcile against it.
//
// Implementations: `SqliteStore` (production) and `MemoryStore` (tests and
// fakes). Multi-row updates are transactional.
// =============================================================================

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::position::{CloseReason, Position, PositionSide};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Append-only ledger entry for one round trip (or its open half).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    /// Realized PnL net of fees, quote currency.
    pub pnl: f64,
    /// Realized PnL as a fraction of entry notional.
    pub pnl_pct: f64,
    pub fees: f64,
    pub close_reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Point-in-time account balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub total: f64,
    pub available: f64,
    pub taken_at: DateTime<Utc>,
}

/// Running per-symbol statistics feeding the Kelly sizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KellyStats {
    pub symbol: String,
    pub wins: u32,
    pub losses: u32,
    /// Sum of winning pnl_pct values (positive).
    pub total_win_pct: f64,
    /// Sum of losing pnl_pct magnitudes (positive).
    pub total_loss_pct: f64,
}

impl KellyStats {
    pub fn trade_count(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Option<f64> {
        let total = self.trade_count();
        (total > 0).then(|| self.wins as f64 / total as f64)
    }

    pub fn avg_win(&self) -> Option<f64> {
        (self.wins > 0).then(|| self.total_win_pct / self.wins as f64)
    }

    pub fn avg_loss(&self) -> Option<f64> {
        (self.losses > 0).then(|| self.total_loss_pct / self.losses as f64)
    }
}

/// Aggregate result row for one UTC trading day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyPerformance {
    /// `YYYY-MM-DD` (UTC).
    pub date: String,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl: f64,
    pub fees: f64,
}

impl DailyPerformance {
    pub fn win_rate(&self) -> Option<f64> {
        (self.trades > 0).then(|| self.wins as f64 / self.trades as f64)
    }
}

/// Audit row for one emitted signal, later backfilled with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPrediction {
    pub id: String,
    pub symbol: String,
    pub score: f64,
    pub confidence: f64,
    pub price_at_prediction: f64,
    pub predicted_at: DateTime<Utc>,
    pub outcome_price: Option<f64>,
    pub outcome_pnl_pct: Option<f64>,
}

impl SignalPrediction {
    pub fn is_resolved(&self) -> bool {
        self.outcome_price.is_some()
    }
}

/// Persisted news item (post-filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsRecord {
    pub id: String,
    pub source: String,
    pub title: String,
    pub sentiment: f64,
    pub confidence: f64,
    pub published_at: DateTime<Utc>,
}

/// Structured system event for the operations log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub level: String,
    pub component: String,
    pub message: String,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Typed DAO operations. Implementations are concurrency-safe; calls are
/// short and may be issued from async contexts directly.
pub trait Store: Send + Sync {
    // --- Trades --------------------------------------------------------------
    fn add_trade(&self, trade: &TradeRecord) -> EngineResult<()>;
    fn update_trade(&self, trade: &TradeRecord) -> EngineResult<()>;
    fn list_trades(&self, symbol: Option<&str>, limit: u32) -> EngineResult<Vec<TradeRecord>>;

    // --- Positions -----------------------------------------------------------
    fn add_position(&self, position: &Position) -> EngineResult<()>;
    fn update_position(&self, position: &Position) -> EngineResult<()>;
    /// Persist the terminal state of a closed position (transactionally
    /// alongside its ledger trade via `update_trade` by callers that own
    /// both, or alone here).
    fn close_position(&self, position: &Position) -> EngineResult<()>;
    fn list_open_positions(&self, symbol: Option<&str>) -> EngineResult<Vec<Position>>;

    // --- Balances ------------------------------------------------------------
    fn latest_balance(&self) -> EngineResult<Option<BalanceSnapshot>>;
    fn add_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> EngineResult<()>;

    // --- Predictions ---------------------------------------------------------
    fn record_signal_prediction(&self, prediction: &SignalPrediction) -> EngineResult<()>;
    fn update_prediction_outcome(
        &self,
        id: &str,
        outcome_price: f64,
        outcome_pnl_pct: f64,
    ) -> EngineResult<()>;
    /// Unresolved predictions older than `cutoff`, for outcome backfill.
    fn unresolved_predictions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<SignalPrediction>>;

    // --- News ----------------------------------------------------------------
    fn add_news(&self, item: &NewsRecord) -> EngineResult<()>;

    // --- Performance ---------------------------------------------------------
    fn get_daily_performance(&self, date: &str) -> EngineResult<Option<DailyPerformance>>;
    fn update_daily_performance(&self, perf: &DailyPerformance) -> EngineResult<()>;

    // --- Kelly ---------------------------------------------------------------
    fn get_kelly_stats(&self, symbol: &str) -> EngineResult<Option<KellyStats>>;
    /// Fold one realized `pnl_pct` into the symbol's running stats
    /// (read-modify-write, transactional).
    fn update_kelly(&self, symbol: &str, pnl_pct: f64) -> EngineResult<()>;

    // --- System events -------------------------------------------------------
    fn append_system_event(
        &self,
        level: &str,
        component: &str,
        message: &str,
        context: serde_json::Value,
    ) -> EngineResult<()>;
    fn recent_system_events(&self, limit: u32) -> EngineResult<Vec<SystemEvent>>;
}
