// =============================================================================
// MemoryStore — in-memory Store fake for tests and dry runs
// =============================================================================
//
// Mirrors SqliteStore semantics (including INSERT OR IGNORE news and the
// outcome-only-once prediction update) without touching disk.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::EngineResult;
use crate::position::{Position, PositionStatus};
use crate::store::{
    BalanceSnapshot, DailyPerformance, KellyStats, NewsRecord, SignalPrediction, Store,
    SystemEvent, TradeRecord,
};

#[derive(Default)]
pub struct MemoryStore {
    trades: RwLock<Vec<TradeRecord>>,
    positions: RwLock<HashMap<String, Position>>,
    balances: RwLock<Vec<BalanceSnapshot>>,
    predictions: RwLock<HashMap<String, SignalPrediction>>,
    news: RwLock<HashMap<String, NewsRecord>>,
    daily: RwLock<HashMap<String, DailyPerformance>>,
    kelly: RwLock<HashMap<String, KellyStats>>,
    events: RwLock<Vec<SystemEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted system events (test helper).
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

impl Store for MemoryStore {
    fn add_trade(&self, trade: &TradeRecord) -> EngineResult<()> {
        self.trades.write().push(trade.clone());
        Ok(())
    }

    fn update_trade(&self, trade: &TradeRecord) -> EngineResult<()> {
        let mut trades = self.trades.write();
        if let Some(existing) = trades.iter_mut().find(|t| t.id == trade.id) {
            *existing = trade.clone();
        }
        Ok(())
    }

    fn list_trades(&self, symbol: Option<&str>, limit: u32) -> EngineResult<Vec<TradeRecord>> {
        let trades = self.trades.read();
        let mut out: Vec<TradeRecord> = trades
            .iter()
            .filter(|t| symbol.map_or(true, |s| t.symbol == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
        out.truncate(limit as usize);
        Ok(out)
    }

    fn add_position(&self, position: &Position) -> EngineResult<()> {
        self.positions
            .write()
            .insert(position.id.clone(), position.clone());
        Ok(())
    }

    fn update_position(&self, position: &Position) -> EngineResult<()> {
        self.add_position(position)
    }

    fn close_position(&self, position: &Position) -> EngineResult<()> {
        self.add_position(position)
    }

    fn list_open_positions(&self, symbol: Option<&str>) -> EngineResult<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    fn latest_balance(&self) -> EngineResult<Option<BalanceSnapshot>> {
        Ok(self.balances.read().last().cloned())
    }

    fn add_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> EngineResult<()> {
        self.balances.write().push(snapshot.clone());
        Ok(())
    }

    fn record_signal_prediction(&self, prediction: &SignalPrediction) -> EngineResult<()> {
        self.predictions
            .write()
            .insert(prediction.id.clone(), prediction.clone());
        Ok(())
    }

    fn update_prediction_outcome(
        &self,
        id: &str,
        outcome_price: f64,
        outcome_pnl_pct: f64,
    ) -> EngineResult<()> {
        if let Some(p) = self.predictions.write().get_mut(id) {
            if p.outcome_price.is_none() {
                p.outcome_price = Some(outcome_price);
                p.outcome_pnl_pct = Some(outcome_pnl_pct);
            }
        }
        Ok(())
    }

    fn unresolved_predictions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<SignalPrediction>> {
        Ok(self
            .predictions
            .read()
            .values()
            .filter(|p| !p.is_resolved() && p.predicted_at <= cutoff)
            .cloned()
            .collect())
    }

    fn add_news(&self, item: &NewsRecord) -> EngineResult<()> {
        self.news
            .write()
            .entry(item.id.clone())
            .or_insert_with(|| item.clone());
        Ok(())
    }

    fn get_daily_performance(&self, date: &str) -> EngineResult<Option<DailyPerformance>> {
        Ok(self.daily.read().get(date).cloned())
    }

    fn update_daily_performance(&self, perf: &DailyPerformance) -> EngineResult<()> {
        self.daily.write().insert(perf.date.clone(), perf.clone());
        Ok(())
    }

    fn get_kelly_stats(&self, symbol: &str) -> EngineResult<Option<KellyStats>> {
        Ok(self.kelly.read().get(symbol).cloned())
    }

    fn update_kelly(&self, symbol: &str, pnl_pct: f64) -> EngineResult<()> {
        let mut kelly = self.kelly.write();
        let stats = kelly.entry(symbol.to_string()).or_insert_with(|| KellyStats {
            symbol: symbol.to_string(),
            ..Default::default()
        });
        if pnl_pct >= 0.0 {
            stats.wins += 1;
            stats.total_win_pct += pnl_pct;
        } else {
            stats.losses += 1;
            stats.total_loss_pct += -pnl_pct;
        }
        Ok(())
    }

    fn append_system_event(
        &self,
        level: &str,
        component: &str,
        message: &str,
        context: serde_json::Value,
    ) -> EngineResult<()> {
        self.events.write().push(SystemEvent {
            level: level.to_string(),
            component: component.to_string(),
            message: message.to_string(),
            context,
            at: Utc::now(),
        });
        Ok(())
    }

    fn recent_system_events(&self, limit: u32) -> EngineResult<Vec<SystemEvent>> {
        let events = self.events.read();
        Ok(events.iter().rev().take(limit as usize).cloned().collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionSide;

    #[test]
    fn open_position_listing_filters_closed() {
        let store = MemoryStore::new();
        let mut pos = Position::open(
            "ETHUSDT",
            PositionSide::Short,
            2.0,
            2_000.0,
            10,
            2_040.0,
            Vec::new(),
            "t".into(),
        );
        store.add_position(&pos).unwrap();
        assert_eq!(store.list_open_positions(None).unwrap().len(), 1);

        pos.mark_closed(crate::position::CloseReason::Manual, 0.0);
        store.close_position(&pos).unwrap();
        assert!(store.list_open_positions(None).unwrap().is_empty());
    }

    #[test]
    fn prediction_outcome_applied_once() {
        let store = MemoryStore::new();
        let p = SignalPrediction {
            id: "p".into(),
            symbol: "BTCUSDT".into(),
            score: 0.2,
            confidence: 50.0,
            price_at_prediction: 100.0,
            predicted_at: Utc::now(),
            outcome_price: None,
            outcome_pnl_pct: None,
        };
        store.record_signal_prediction(&p).unwrap();
        store.update_prediction_outcome("p", 101.0, 0.01).unwrap();
        store.update_prediction_outcome("p", 999.0, 9.0).unwrap();

        let all = store.unresolved_predictions_before(Utc::now()).unwrap();
        assert!(all.is_empty());
        let stored = store.predictions.read().get("p").cloned().unwrap();
        assert_eq!(stored.outcome_price, Some(101.0));
    }

    #[test]
    fn kelly_mirrors_sqlite_semantics() {
        let store = MemoryStore::new();
        store.update_kelly("BTCUSDT", 0.03).unwrap();
        store.update_kelly("BTCUSDT", -0.02).unwrap();
        let stats = store.get_kelly_stats("BTCUSDT").unwrap().unwrap();
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert!((stats.total_loss_pct - 0.02).abs() < 1e-12);
    }
}
