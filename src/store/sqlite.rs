// =============================================================================
// SqliteStore — rusqlite-backed implementation of the Store trait
// =============================================================================
//
// Single connection behind a Mutex (SQLite serialises writers anyway), WAL
// journal mode for concurrent readers, and explicit transactions for
// read-modify-write operations (Kelly stats, daily performance, close).
//
// Queries taking longer than one second are logged as slow.
// =============================================================================

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::position::{Position, PositionStatus};
use crate::store::{
    BalanceSnapshot, DailyPerformance, KellyStats, NewsRecord, SignalPrediction, Store,
    SystemEvent, TradeRecord,
};

/// Threshold beyond which a query is logged as slow.
const SLOW_QUERY: Duration = Duration::from_secs(1);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and migrate the schema.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::migrate(&conn)?;
        info!(path = %path.as_ref().display(), "sqlite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (tests).
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id            TEXT PRIMARY KEY,
                symbol        TEXT NOT NULL,
                side          TEXT NOT NULL,
                quantity      REAL NOT NULL,
                entry_price   REAL NOT NULL,
                exit_price    REAL,
                pnl           REAL NOT NULL DEFAULT 0,
                pnl_pct       REAL NOT NULL DEFAULT 0,
                fees          REAL NOT NULL DEFAULT 0,
                close_reason  TEXT,
                opened_at     TEXT NOT NULL,
                closed_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, opened_at);

            CREATE TABLE IF NOT EXISTS positions (
                id        TEXT PRIMARY KEY,
                symbol    TEXT NOT NULL,
                status    TEXT NOT NULL,
                body      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status, symbol);

            CREATE TABLE IF NOT EXISTS balance_snapshots (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                total     REAL NOT NULL,
                available REAL NOT NULL,
                taken_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS signal_predictions (
                id                  TEXT PRIMARY KEY,
                symbol              TEXT NOT NULL,
                score               REAL NOT NULL,
                confidence          REAL NOT NULL,
                price_at_prediction REAL NOT NULL,
                predicted_at        TEXT NOT NULL,
                outcome_price       REAL,
                outcome_pnl_pct     REAL
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_open
                ON signal_predictions(predicted_at)
                WHERE outcome_price IS NULL;

            CREATE TABLE IF NOT EXISTS news (
                id           TEXT PRIMARY KEY,
                source       TEXT NOT NULL,
                title        TEXT NOT NULL,
                sentiment    REAL NOT NULL,
                confidence   REAL NOT NULL,
                published_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_performance (
                date   TEXT PRIMARY KEY,
                trades INTEGER NOT NULL DEFAULT 0,
                wins   INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                pnl    REAL NOT NULL DEFAULT 0,
                fees   REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS kelly_stats (
                symbol         TEXT PRIMARY KEY,
                wins           INTEGER NOT NULL DEFAULT 0,
                losses         INTEGER NOT NULL DEFAULT 0,
                total_win_pct  REAL NOT NULL DEFAULT 0,
                total_loss_pct REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS system_events (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                level     TEXT NOT NULL,
                component TEXT NOT NULL,
                message   TEXT NOT NULL,
                context   TEXT NOT NULL,
                at        TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Run `f` under the connection lock, logging slow queries.
    fn with_conn<T>(
        &self,
        name: &'static str,
        f: impl FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    ) -> EngineResult<T> {
        let started = Instant::now();
        let mut conn = self.conn.lock();
        let result = f(&mut conn);
        let elapsed = started.elapsed();
        if elapsed > SLOW_QUERY {
            warn!(query = name, elapsed_ms = elapsed.as_millis() as u64, "slow query");
        }
        result.map_err(EngineError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn trade_from_row(row: &Row<'_>) -> Result<TradeRecord, rusqlite::Error> {
    let side: String = row.get("side")?;
    let reason: Option<String> = row.get("close_reason")?;
    Ok(TradeRecord {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        side: side.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        quantity: row.get("quantity")?,
        entry_price: row.get("entry_price")?,
        exit_price: row.get("exit_price")?,
        pnl: row.get("pnl")?,
        pnl_pct: row.get("pnl_pct")?,
        fees: row.get("fees")?,
        close_reason: reason.and_then(|r| serde_json::from_value(serde_json::json!(r)).ok()),
        opened_at: parse_ts(row.get::<_, String>("opened_at")?)?,
        closed_at: row
            .get::<_, Option<String>>("closed_at")?
            .map(parse_ts)
            .transpose()?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn position_from_row(row: &Row<'_>) -> Result<Position, rusqlite::Error> {
    let body: String = row.get("body")?;
    serde_json::from_str(&body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    fn add_trade(&self, trade: &TradeRecord) -> EngineResult<()> {
        self.with_conn("add_trade", |conn| {
            conn.execute(
                "INSERT INTO trades
                   (id, symbol, side, quantity, entry_price, exit_price, pnl, pnl_pct,
                    fees, close_reason, opened_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    trade.id,
                    trade.symbol,
                    trade.side.to_string(),
                    trade.quantity,
                    trade.entry_price,
                    trade.exit_price,
                    trade.pnl,
                    trade.pnl_pct,
                    trade.fees,
                    trade.close_reason.map(|r| r.to_string()),
                    trade.opened_at.to_rfc3339(),
                    trade.closed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    fn update_trade(&self, trade: &TradeRecord) -> EngineResult<()> {
        self.with_conn("update_trade", |conn| {
            conn.execute(
                "UPDATE trades SET
                   exit_price = ?2, pnl = ?3, pnl_pct = ?4, fees = ?5,
                   close_reason = ?6, closed_at = ?7
                 WHERE id = ?1",
                params![
                    trade.id,
                    trade.exit_price,
                    trade.pnl,
                    trade.pnl_pct,
                    trade.fees,
                    trade.close_reason.map(|r| r.to_string()),
                    trade.closed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    fn list_trades(&self, symbol: Option<&str>, limit: u32) -> EngineResult<Vec<TradeRecord>> {
        self.with_conn("list_trades", |conn| {
            let mut out = Vec::new();
            match symbol {
                Some(sym) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM trades WHERE symbol = ?1
                         ORDER BY opened_at DESC LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![sym, limit], trade_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM trades ORDER BY opened_at DESC LIMIT ?1")?;
                    let rows = stmt.query_map(params![limit], trade_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    fn add_position(&self, position: &Position) -> EngineResult<()> {
        let body = serde_json::to_string(position)
            .map_err(|e| EngineError::Internal(format!("serialize position: {e}")))?;
        self.with_conn("add_position", |conn| {
            conn.execute(
                "INSERT INTO positions (id, symbol, status, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    position.id,
                    position.symbol,
                    position.status.to_string(),
                    body
                ],
            )?;
            Ok(())
        })
    }

    fn update_position(&self, position: &Position) -> EngineResult<()> {
        let body = serde_json::to_string(position)
            .map_err(|e| EngineError::Internal(format!("serialize position: {e}")))?;
        self.with_conn("update_position", |conn| {
            conn.execute(
                "UPDATE positions SET symbol = ?2, status = ?3, body = ?4 WHERE id = ?1",
                params![
                    position.id,
                    position.symbol,
                    position.status.to_string(),
                    body
                ],
            )?;
            Ok(())
        })
    }

    fn close_position(&self, position: &Position) -> EngineResult<()> {
        debug_assert_eq!(position.status, PositionStatus::Closed);
        self.update_position(position)
    }

    fn list_open_positions(&self, symbol: Option<&str>) -> EngineResult<Vec<Position>> {
        self.with_conn("list_open_positions", |conn| {
            let mut out = Vec::new();
            match symbol {
                Some(sym) => {
                    let mut stmt = conn.prepare(
                        "SELECT body FROM positions WHERE status = 'open' AND symbol = ?1",
                    )?;
                    let rows = stmt.query_map(params![sym], position_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT body FROM positions WHERE status = 'open'")?;
                    let rows = stmt.query_map([], position_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    fn latest_balance(&self) -> EngineResult<Option<BalanceSnapshot>> {
        self.with_conn("latest_balance", |conn| {
            conn.query_row(
                "SELECT total, available, taken_at FROM balance_snapshots
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(BalanceSnapshot {
                        total: row.get(0)?,
                        available: row.get(1)?,
                        taken_at: parse_ts(row.get::<_, String>(2)?)?,
                    })
                },
            )
            .optional()
        })
    }

    fn add_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> EngineResult<()> {
        self.with_conn("add_balance_snapshot", |conn| {
            conn.execute(
                "INSERT INTO balance_snapshots (total, available, taken_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    snapshot.total,
                    snapshot.available,
                    snapshot.taken_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    fn record_signal_prediction(&self, prediction: &SignalPrediction) -> EngineResult<()> {
        self.with_conn("record_signal_prediction", |conn| {
            conn.execute(
                "INSERT INTO signal_predictions
                   (id, symbol, score, confidence, price_at_prediction, predicted_at,
                    outcome_price, outcome_pnl_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    prediction.id,
                    prediction.symbol,
                    prediction.score,
                    prediction.confidence,
                    prediction.price_at_prediction,
                    prediction.predicted_at.to_rfc3339(),
                    prediction.outcome_price,
                    prediction.outcome_pnl_pct,
                ],
            )?;
            Ok(())
        })
    }

    fn update_prediction_outcome(
        &self,
        id: &str,
        outcome_price: f64,
        outcome_pnl_pct: f64,
    ) -> EngineResult<()> {
        self.with_conn("update_prediction_outcome", |conn| {
            conn.execute(
                "UPDATE signal_predictions
                 SET outcome_price = ?2, outcome_pnl_pct = ?3
                 WHERE id = ?1 AND outcome_price IS NULL",
                params![id, outcome_price, outcome_pnl_pct],
            )?;
            Ok(())
        })
    }

    fn unresolved_predictions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EngineResult<Vec<SignalPrediction>> {
        self.with_conn("unresolved_predictions_before", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, symbol, score, confidence, price_at_prediction, predicted_at,
                        outcome_price, outcome_pnl_pct
                 FROM signal_predictions
                 WHERE outcome_price IS NULL AND predicted_at <= ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| {
                Ok(SignalPrediction {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    score: row.get(2)?,
                    confidence: row.get(3)?,
                    price_at_prediction: row.get(4)?,
                    predicted_at: parse_ts(row.get::<_, String>(5)?)?,
                    outcome_price: row.get(6)?,
                    outcome_pnl_pct: row.get(7)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn add_news(&self, item: &NewsRecord) -> EngineResult<()> {
        self.with_conn("add_news", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO news
                   (id, source, title, sentiment, confidence, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    item.id,
                    item.source,
                    item.title,
                    item.sentiment,
                    item.confidence,
                    item.published_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_daily_performance(&self, date: &str) -> EngineResult<Option<DailyPerformance>> {
        self.with_conn("get_daily_performance", |conn| {
            conn.query_row(
                "SELECT date, trades, wins, losses, pnl, fees
                 FROM daily_performance WHERE date = ?1",
                params![date],
                |row| {
                    Ok(DailyPerformance {
                        date: row.get(0)?,
                        trades: row.get(1)?,
                        wins: row.get(2)?,
                        losses: row.get(3)?,
                        pnl: row.get(4)?,
                        fees: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }

    fn update_daily_performance(&self, perf: &DailyPerformance) -> EngineResult<()> {
        self.with_conn("update_daily_performance", |conn| {
            conn.execute(
                "INSERT INTO daily_performance (date, trades, wins, losses, pnl, fees)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(date) DO UPDATE SET
                   trades = excluded.trades, wins = excluded.wins,
                   losses = excluded.losses, pnl = excluded.pnl, fees = excluded.fees",
                params![
                    perf.date,
                    perf.trades,
                    perf.wins,
                    perf.losses,
                    perf.pnl,
                    perf.fees
                ],
            )?;
            Ok(())
        })
    }

    fn get_kelly_stats(&self, symbol: &str) -> EngineResult<Option<KellyStats>> {
        self.with_conn("get_kelly_stats", |conn| {
            conn.query_row(
                "SELECT symbol, wins, losses, total_win_pct, total_loss_pct
                 FROM kelly_stats WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok(KellyStats {
                        symbol: row.get(0)?,
                        wins: row.get(1)?,
                        losses: row.get(2)?,
                        total_win_pct: row.get(3)?,
                        total_loss_pct: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    fn update_kelly(&self, symbol: &str, pnl_pct: f64) -> EngineResult<()> {
        self.with_conn("update_kelly", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO kelly_stats (symbol) VALUES (?1)",
                params![symbol],
            )?;
            if pnl_pct >= 0.0 {
                tx.execute(
                    "UPDATE kelly_stats
                     SET wins = wins + 1, total_win_pct = total_win_pct + ?2
                     WHERE symbol = ?1",
                    params![symbol, pnl_pct],
                )?;
            } else {
                tx.execute(
                    "UPDATE kelly_stats
                     SET losses = losses + 1, total_loss_pct = total_loss_pct + ?2
                     WHERE symbol = ?1",
                    params![symbol, -pnl_pct],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn append_system_event(
        &self,
        level: &str,
        component: &str,
        message: &str,
        context: serde_json::Value,
    ) -> EngineResult<()> {
        self.with_conn("append_system_event", |conn| {
            conn.execute(
                "INSERT INTO system_events (level, component, message, context, at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    level,
                    component,
                    message,
                    context.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    fn recent_system_events(&self, limit: u32) -> EngineResult<Vec<SystemEvent>> {
        self.with_conn("recent_system_events", |conn| {
            let mut stmt = conn.prepare(
                "SELECT level, component, message, context, at
                 FROM system_events ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let context_raw: String = row.get(3)?;
                Ok(SystemEvent {
                    level: row.get(0)?,
                    component: row.get(1)?,
                    message: row.get(2)?,
                    context: serde_json::from_str(&context_raw)
                        .unwrap_or(serde_json::Value::Null),
                    at: parse_ts(row.get::<_, String>(4)?)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{PositionSide, TakeProfitLevel};

    fn sample_position() -> Position {
        Position::open(
            "BTCUSDT",
            PositionSide::Long,
            0.5,
            40_000.0,
            20,
            39_600.0,
            vec![TakeProfitLevel {
                price: 40_800.0,
                size_fraction: 0.5,
                executed: false,
            }],
            "trade-1".into(),
        )
    }

    #[test]
    fn position_roundtrip_preserves_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pos = sample_position();
        store.add_position(&pos).unwrap();

        let loaded = store.list_open_positions(Some("BTCUSDT")).unwrap();
        assert_eq!(loaded.len(), 1);
        let reloaded = &loaded[0];
        assert_eq!(reloaded.id, pos.id);
        assert_eq!(reloaded.symbol, pos.symbol);
        assert_eq!(reloaded.side, pos.side);
        assert_eq!(reloaded.quantity, pos.quantity);
        assert_eq!(reloaded.stop_loss, pos.stop_loss);
        assert_eq!(reloaded.take_profits.len(), 1);
        assert_eq!(reloaded.trade_id, pos.trade_id);
    }

    #[test]
    fn closed_positions_leave_open_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut pos = sample_position();
        store.add_position(&pos).unwrap();

        pos.mark_closed(crate::position::CloseReason::StopLoss, -10.0);
        store.close_position(&pos).unwrap();

        assert!(store.list_open_positions(None).unwrap().is_empty());
    }

    #[test]
    fn kelly_accumulates_transactionally() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.update_kelly("BTCUSDT", 0.02).unwrap();
        store.update_kelly("BTCUSDT", 0.04).unwrap();
        store.update_kelly("BTCUSDT", -0.01).unwrap();

        let stats = store.get_kelly_stats("BTCUSDT").unwrap().unwrap();
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        assert!((stats.avg_win().unwrap() - 0.03).abs() < 1e-12);
        assert!((stats.avg_loss().unwrap() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn trades_listing_respects_symbol_and_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            let trade = TradeRecord {
                id: format!("t{i}"),
                symbol: if i % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" }.into(),
                side: PositionSide::Long,
                quantity: 1.0,
                entry_price: 100.0,
                exit_price: None,
                pnl: 0.0,
                pnl_pct: 0.0,
                fees: 0.0,
                close_reason: None,
                opened_at: Utc::now(),
                closed_at: None,
            };
            store.add_trade(&trade).unwrap();
        }
        assert_eq!(store.list_trades(Some("BTCUSDT"), 10).unwrap().len(), 3);
        assert_eq!(store.list_trades(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn prediction_outcome_backfill() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prediction = SignalPrediction {
            id: "p1".into(),
            symbol: "BTCUSDT".into(),
            score: 0.6,
            confidence: 80.0,
            price_at_prediction: 40_000.0,
            predicted_at: Utc::now() - chrono::Duration::hours(2),
            outcome_price: None,
            outcome_pnl_pct: None,
        };
        store.record_signal_prediction(&prediction).unwrap();

        let open = store
            .unresolved_predictions_before(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(open.len(), 1);

        store
            .update_prediction_outcome("p1", 40_400.0, 0.01)
            .unwrap();
        let open = store
            .unresolved_predictions_before(Utc::now())
            .unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn daily_performance_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut perf = DailyPerformance {
            date: "2025-06-01".into(),
            trades: 1,
            wins: 1,
            losses: 0,
            pnl: 10.0,
            fees: 0.5,
        };
        store.update_daily_performance(&perf).unwrap();
        perf.trades = 2;
        perf.losses = 1;
        perf.pnl = 4.0;
        store.update_daily_performance(&perf).unwrap();

        let loaded = store.get_daily_performance("2025-06-01").unwrap().unwrap();
        assert_eq!(loaded.trades, 2);
        assert_eq!(loaded.pnl, 4.0);
    }

    #[test]
    fn duplicate_news_is_ignored() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = NewsRecord {
            id: "hash-1".into(),
            source: "wire".into(),
            title: "headline".into(),
            sentiment: 0.5,
            confidence: 0.8,
            published_at: Utc::now(),
        };
        store.add_news(&item).unwrap();
        store.add_news(&item).unwrap(); // INSERT OR IGNORE
    }

    #[test]
    fn system_events_are_appended_and_listed() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_system_event(
                "warn",
                "risk",
                "daily loss limit approached",
                serde_json::json!({"daily_pnl_pct": -4.2}),
            )
            .unwrap();
        let events = store.recent_system_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].component, "risk");
        assert_eq!(events[0].context["daily_pnl_pct"], -4.2);
    }
}
