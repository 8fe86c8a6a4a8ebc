// =============================================================================
// Position Manager — open, manage, close, reconcile
// =============================================================================
//
// Owns every mutation of open positions. Per-symbol async mutexes serialise
// order operations: no two open/close/stop changes overlap for one symbol,
// while different symbols proceed concurrently under the shared rate
// limiter.
//
// Manage pass per position (each cycle):
//   1. refresh price (live cache, REST fallback)
//   2. track max profit seen
//   3. trailing-stop state machine (never loosens)
//   4. partial take-profits
//   5. stop-loss hit -> close remainder
//   6. early-exit guard on rapid adverse moves
//   7. periodic ATR re-evaluation (tighten only)
//
// Reconciliation at cycle start: positions only in the Store are imported,
// positions only in memory are discarded.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, SymbolSpec};
use crate::error::{EngineError, EngineResult};
use crate::exchange::{ExchangePort, OrderRequest};
use crate::market_data::Candle;
use crate::notify::{MessageClass, Notification, Notifier, Priority};
use crate::position::{CloseReason, Position, PositionSide, TakeProfitLevel, TrailingUpdate};
use crate::risk::stops;
use crate::signal::Signal;
use crate::store::{Store, TradeRecord};

/// Early-exit guard: close when the loss reaches this fraction of the
/// symbol's fallback stop.
const EARLY_EXIT_FRACTION: f64 = 0.7;
/// Interval between ATR stop re-evaluations.
const ATR_REEVAL_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Relative ATR change that triggers a stop re-evaluation.
const ATR_CHANGE_THRESHOLD: f64 = 0.2;

pub struct PositionManager {
    exchange: Arc<dyn ExchangePort>,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    taker_fee: f64,
    /// In-memory open-position cache, keyed by position id.
    open: RwLock<HashMap<String, Position>>,
    /// Per-symbol order serialisation.
    symbol_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    /// Last ATR value + evaluation time per position id.
    atr_state: RwLock<HashMap<String, (f64, Instant)>>,
}

impl PositionManager {
    pub fn new(
        config: &Config,
        exchange: Arc<dyn ExchangePort>,
        store: Arc<dyn Store>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            exchange,
            store,
            notifier,
            taker_fee: config.taker_fee,
            open: RwLock::new(HashMap::new()),
            symbol_locks: RwLock::new(HashMap::new()),
            atr_state: RwLock::new(HashMap::new()),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_positions_for(&self, symbol: &str) -> Vec<Position> {
        self.open
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a position from a tradeable signal and an approved allocation.
    pub async fn open(
        &self,
        spec: &SymbolSpec,
        signal: &Signal,
        allocation: f64,
    ) -> EngineResult<Position> {
        let side = crate::position::PositionSide::from_direction(signal.direction)
            .ok_or_else(|| EngineError::Internal("cannot open a neutral position".into()))?;

        let lock = self.symbol_lock(&spec.symbol);
        let _guard = lock.lock().await;

        let price = self
            .current_price(&spec.symbol)
            .await
            .ok_or_else(|| EngineError::DataStale(format!("no price for {}", spec.symbol)))?;

        // Contracts from levered notional, with a taker-fee reserve so the
        // margin check cannot be breached by the entry fee.
        let notional = allocation * spec.leverage as f64 * (1.0 - self.taker_fee);
        let mut quantity = notional / price;
        // Round down to lot size.
        if spec.lot_size > 0.0 {
            quantity = (quantity / spec.lot_size).floor() * spec.lot_size;
        }
        if quantity <= 0.0 {
            return Err(EngineError::InsufficientFunds(format!(
                "allocation {allocation:.2} rounds to zero contracts"
            )));
        }

        self.exchange
            .set_leverage(&spec.symbol, spec.leverage)
            .await?;

        let entry = self
            .exchange
            .place_order(&OrderRequest::market(&spec.symbol, side.entry_side(), quantity))
            .await?;
        let fill_price = entry.fill_price.unwrap_or(price);

        // Stop + target levels around the actual fill, at quote precision.
        let is_long = side == PositionSide::Long;
        let stop_loss = round_price(
            stops::stop_price(fill_price, signal.stop_pct, is_long),
            spec.quote_precision,
        );
        let take_profits: Vec<TakeProfitLevel> =
            stops::target_ladder(fill_price, signal.target_pct, is_long)
                .into_iter()
                .map(|(price, size_fraction)| TakeProfitLevel {
                    price: round_price(price, spec.quote_precision),
                    size_fraction,
                    executed: false,
                })
                .collect();

        let trade_id = Uuid::new_v4().to_string();
        let mut position = Position::open(
            &spec.symbol,
            side,
            quantity,
            fill_price,
            spec.leverage,
            stop_loss,
            take_profits,
            trade_id.clone(),
        );

        // Resting stop order. Failure leaves the position open; the next
        // manage pass retries.
        match self
            .exchange
            .place_order(&OrderRequest::stop_market(
                &spec.symbol,
                side.exit_side(),
                quantity,
                stop_loss,
            ))
            .await
        {
            Ok(stop_order) => position.stop_order_id = Some(stop_order.order_id),
            Err(e) => {
                warn!(
                    symbol = %spec.symbol,
                    error = %e,
                    "stop placement failed — will retry on next manage pass"
                );
            }
        }

        let trade = TradeRecord {
            id: trade_id,
            symbol: spec.symbol.clone(),
            side,
            quantity,
            entry_price: fill_price,
            exit_price: None,
            pnl: 0.0,
            pnl_pct: 0.0,
            fees: fill_price * quantity * self.taker_fee,
            close_reason: None,
            opened_at: position.opened_at,
            closed_at: None,
        };
        self.store.add_trade(&trade)?;
        self.store.add_position(&position)?;
        self.open
            .write()
            .insert(position.id.clone(), position.clone());

        info!(
            id = %position.id,
            symbol = %spec.symbol,
            side = %side,
            quantity,
            fill_price,
            stop_loss,
            "position opened"
        );
        self.notifier.send(Notification::new(
            format!(
                "Opened {side} {quantity} {} @ {fill_price:.2} (stop {stop_loss:.2})",
                spec.symbol
            ),
            Priority::High,
            MessageClass::Trade,
        ));

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Manage
    // -------------------------------------------------------------------------

    /// Run the manage pass for every open position on `symbol`.
    /// `atr_candles` feeds the periodic stop re-evaluation when available.
    pub async fn manage_symbol(
        &self,
        spec: &SymbolSpec,
        atr_candles: Option<&[Candle]>,
    ) -> EngineResult<()> {
        let ids: Vec<String> = self
            .open
            .read()
            .values()
            .filter(|p| p.symbol == spec.symbol)
            .map(|p| p.id.clone())
            .collect();

        for id in ids {
            if let Err(e) = self.manage_one(spec, &id, atr_candles).await {
                if e.is_operational() {
                    info!(position = %id, outcome = %e, "manage pass outcome");
                } else {
                    warn!(position = %id, error = %e, "manage pass deferred");
                }
            }
        }
        Ok(())
    }

    async fn manage_one(
        &self,
        spec: &SymbolSpec,
        position_id: &str,
        atr_candles: Option<&[Candle]>,
    ) -> EngineResult<()> {
        let lock = self.symbol_lock(&spec.symbol);
        let _guard = lock.lock().await;

        // 1. Refresh price.
        let Some(price) = self.current_price(&spec.symbol).await else {
            return Err(EngineError::DataStale(format!(
                "no price for {} — deferring manage pass",
                spec.symbol
            )));
        };

        let Some(mut position) = self.open.read().get(position_id).cloned() else {
            return Ok(()); // closed concurrently
        };

        // 2. Best profit seen.
        position.note_price(price);

        // Retry a missing stop order before anything else.
        if position.stop_order_id.is_none() {
            match self
                .exchange
                .place_order(&OrderRequest::stop_market(
                    &position.symbol,
                    position.side.exit_side(),
                    position.quantity,
                    position.stop_loss,
                ))
                .await
            {
                Ok(order) => {
                    position.stop_order_id = Some(order.order_id);
                    info!(position = %position.id, "missing stop order placed");
                }
                Err(e) => warn!(position = %position.id, error = %e, "stop retry failed"),
            }
        }

        // 3. Trailing stop.
        match position.update_trailing(price, &spec.trailing) {
            TrailingUpdate::Activated(stop) => {
                info!(position = %position.id, stop, "trailing stop activated");
                self.push_stop_order(&mut position).await;
            }
            TrailingUpdate::Moved(stop) => {
                debug!(position = %position.id, stop, "trailing stop moved");
                self.push_stop_order(&mut position).await;
            }
            TrailingUpdate::Inactive | TrailingUpdate::Unchanged => {}
        }

        // 4. Partial take-profits.
        for index in position.crossed_take_profits(price) {
            let level = position.take_profits[index].clone();
            let close_qty =
                (level.size_fraction * position.initial_quantity).min(position.quantity);
            if close_qty <= 0.0 {
                position.take_profits[index].executed = true;
                continue;
            }
            match self
                .exchange
                .place_order(
                    &OrderRequest::market(&position.symbol, position.side.exit_side(), close_qty)
                        .reduce_only(),
                )
                .await
            {
                Ok(order) => {
                    let fill = order.fill_price.unwrap_or(price);
                    let pnl = position.side.sign()
                        * (fill - position.entry_price)
                        * close_qty
                        - fill * close_qty * self.taker_fee;
                    position.take_profits[index].executed = true;
                    position.quantity -= close_qty;
                    position.realized_pnl += pnl;
                    info!(
                        position = %position.id,
                        level = index,
                        close_qty,
                        fill,
                        pnl,
                        "partial take-profit executed"
                    );
                    self.notifier.send(Notification::new(
                        format!(
                            "Partial TP on {} at {fill:.2} ({close_qty} closed, pnl {pnl:.2})",
                            position.symbol
                        ),
                        Priority::Normal,
                        MessageClass::Trade,
                    ));
                }
                Err(e) => {
                    warn!(position = %position.id, error = %e, "partial TP order failed");
                    break;
                }
            }
        }

        // Persist manage-pass mutations before the exit checks.
        self.store.update_position(&position)?;
        self.open
            .write()
            .insert(position.id.clone(), position.clone());

        // 5. Stop-loss / trailing-stop hit.
        if position.stop_crossed(price) {
            let reason = if position.trailing_active {
                CloseReason::TrailingStop
            } else {
                CloseReason::StopLoss
            };
            return self.close_locked(position, reason, price).await;
        }

        // 6. Early-exit guard.
        let profit = position.profit_pct(price);
        if profit <= -(spec.fallback_stop_pct * EARLY_EXIT_FRACTION) {
            info!(
                position = %position.id,
                profit_pct = profit * 100.0,
                "early-exit guard triggered"
            );
            return self.close_locked(position, CloseReason::EarlyStop, price).await;
        }

        // 7. Periodic ATR re-evaluation (tighten only).
        if let Some(candles) = atr_candles {
            self.reevaluate_atr(spec, &mut position, candles, price).await?;
        }

        Ok(())
    }

    /// Recompute ATR on schedule; if it moved more than the threshold,
    /// tighten the stop (never loosen) and reproportion the targets.
    async fn reevaluate_atr(
        &self,
        spec: &SymbolSpec,
        position: &mut Position,
        candles: &[Candle],
        price: f64,
    ) -> EngineResult<()> {
        let due = {
            let state = self.atr_state.read();
            state
                .get(&position.id)
                .map_or(true, |(_, at)| at.elapsed() >= ATR_REEVAL_INTERVAL)
        };
        if !due {
            return Ok(());
        }
        let Some(atr) = crate::indicators::atr::atr_latest(candles, spec.atr.period) else {
            return Ok(());
        };

        let previous = self.atr_state.read().get(&position.id).map(|(a, _)| *a);
        self.atr_state
            .write()
            .insert(position.id.clone(), (atr, Instant::now()));

        let Some(previous) = previous else {
            return Ok(());
        };
        if previous <= 0.0 || ((atr - previous) / previous).abs() <= ATR_CHANGE_THRESHOLD {
            return Ok(());
        }

        let stop_pct = (atr * spec.atr.stop_multiplier / price)
            .clamp(spec.atr.min_stop_distance, spec.atr.max_stop_distance);
        let candidate = stops::stop_price(price, stop_pct, position.side == PositionSide::Long);
        let tighter = match position.side {
            PositionSide::Long => candidate > position.stop_loss,
            PositionSide::Short => candidate < position.stop_loss,
        };
        if tighter {
            info!(
                position = %position.id,
                old_stop = position.stop_loss,
                new_stop = candidate,
                "ATR shift — tightening stop"
            );
            position.stop_loss = candidate;
            // Targets keep their distance ratio to the new stop.
            let scale = stop_pct / spec.fallback_stop_pct.max(1e-9);
            for tp in position.take_profits.iter_mut().filter(|tp| !tp.executed) {
                let distance = tp.price - position.entry_price;
                tp.price = position.entry_price + distance * scale.clamp(0.5, 1.0);
            }
            self.push_stop_order(position).await;
            self.store.update_position(position)?;
            self.open
                .write()
                .insert(position.id.clone(), position.clone());
        }
        Ok(())
    }

    /// Replace the resting stop order with one at the current stop level.
    async fn push_stop_order(&self, position: &mut Position) {
        if let Some(old) = position.stop_order_id.take() {
            if let Err(e) = self.exchange.cancel_order(&old, &position.symbol).await {
                debug!(position = %position.id, error = %e, "old stop cancel failed");
            }
        }
        let stop = position.trailing_stop.unwrap_or(position.stop_loss);
        match self
            .exchange
            .place_order(&OrderRequest::stop_market(
                &position.symbol,
                position.side.exit_side(),
                position.quantity,
                stop,
            ))
            .await
        {
            Ok(order) => position.stop_order_id = Some(order.order_id),
            Err(e) => warn!(position = %position.id, error = %e, "stop replacement failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close one position (public entry point takes the symbol lock).
    pub async fn close(
        &self,
        position_id: &str,
        reason: CloseReason,
    ) -> EngineResult<Option<f64>> {
        let Some(position) = self.open.read().get(position_id).cloned() else {
            return Ok(None);
        };
        let lock = self.symbol_lock(&position.symbol);
        let _guard = lock.lock().await;

        // Re-read under the lock.
        let Some(position) = self.open.read().get(position_id).cloned() else {
            return Ok(None);
        };
        let price = self
            .current_price(&position.symbol)
            .await
            .unwrap_or(position.entry_price);
        self.close_locked(position, reason, price).await?;
        Ok(Some(price))
    }

    /// Close every open position on a symbol (emergency path).
    pub async fn close_all_for_symbol(
        &self,
        symbol: &str,
        reason: CloseReason,
    ) -> EngineResult<usize> {
        let ids: Vec<String> = self
            .open
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.id.clone())
            .collect();
        let mut closed = 0;
        for id in &ids {
            if self.close(id, reason).await?.is_some() {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Close with the symbol lock already held.
    async fn close_locked(
        &self,
        mut position: Position,
        reason: CloseReason,
        price_hint: f64,
    ) -> EngineResult<()> {
        let fill = if position.quantity > 0.0 {
            match self
                .exchange
                .place_order(
                    &OrderRequest::market(
                        &position.symbol,
                        position.side.exit_side(),
                        position.quantity,
                    )
                    .reduce_only(),
                )
                .await
            {
                Ok(order) => order.fill_price.unwrap_or(price_hint),
                Err(e) => {
                    // The position stays open; the next cycle retries.
                    warn!(position = %position.id, error = %e, "close order failed — deferred");
                    return Err(e.into());
                }
            }
        } else {
            price_hint
        };

        // Cancel the resting stop.
        if let Some(stop_id) = position.stop_order_id.take() {
            if let Err(e) = self.exchange.cancel_order(&stop_id, &position.symbol).await {
                debug!(position = %position.id, error = %e, "stop cancel on close failed");
            }
        }

        // Realized PnL for the remainder, net of the exit fee.
        let quantity = position.quantity;
        let gross = position.side.sign() * (fill - position.entry_price) * quantity;
        let exit_fee = fill * quantity * self.taker_fee;
        let final_pnl = gross - exit_fee;

        position.mark_closed(reason, final_pnl);
        let total_pnl = position.realized_pnl;
        let entry_notional = position.entry_price * position.initial_quantity;
        let pnl_pct = if entry_notional > 0.0 {
            total_pnl / entry_notional
        } else {
            0.0
        };

        // Ledger trade (fees are two-sided: entry fee was booked at open).
        let mut trades = self.store.list_trades(Some(&position.symbol), 200)?;
        if let Some(trade) = trades.iter_mut().find(|t| t.id == position.trade_id) {
            trade.exit_price = Some(fill);
            trade.pnl = total_pnl;
            trade.pnl_pct = pnl_pct;
            trade.fees += exit_fee;
            trade.close_reason = Some(reason);
            trade.closed_at = position.closed_at;
            self.store.update_trade(trade)?;
        }
        self.store.close_position(&position)?;
        self.store.update_kelly(&position.symbol, pnl_pct)?;
        self.update_daily_performance(total_pnl, exit_fee)?;

        self.open.write().remove(&position.id);
        self.atr_state.write().remove(&position.id);

        info!(
            id = %position.id,
            symbol = %position.symbol,
            reason = %reason,
            fill,
            realized_pnl = total_pnl,
            "position closed"
        );
        self.notifier.send(Notification::new(
            format!(
                "Closed {} {} @ {fill:.2} ({reason}) pnl {total_pnl:.2}",
                position.side, position.symbol
            ),
            if reason == CloseReason::Emergency {
                Priority::Emergency
            } else {
                Priority::High
            },
            MessageClass::Trade,
        ));
        Ok(())
    }

    fn update_daily_performance(&self, pnl: f64, fees: f64) -> EngineResult<()> {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let mut perf = self
            .store
            .get_daily_performance(&date)?
            .unwrap_or_else(|| crate::store::DailyPerformance {
                date: date.clone(),
                ..Default::default()
            });
        perf.trades += 1;
        if pnl >= 0.0 {
            perf.wins += 1;
        } else {
            perf.losses += 1;
        }
        perf.pnl += pnl;
        perf.fees += fees;
        self.store.update_daily_performance(&perf)
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Diff the Store's open positions against the in-memory map. DB-only
    /// positions are imported; memory-only positions are discarded.
    pub fn reconcile(&self) -> EngineResult<(usize, usize)> {
        let persisted = self.store.list_open_positions(None)?;
        let mut open = self.open.write();

        let persisted_ids: std::collections::HashSet<&str> =
            persisted.iter().map(|p| p.id.as_str()).collect();

        let before = open.len();
        open.retain(|id, _| persisted_ids.contains(id.as_str()));
        let dropped = before - open.len();

        let mut imported = 0;
        for position in persisted {
            if !open.contains_key(&position.id) {
                debug!(id = %position.id, symbol = %position.symbol, "position imported from store");
                open.insert(position.id.clone(), position);
                imported += 1;
            }
        }

        if imported > 0 || dropped > 0 {
            info!(imported, dropped, "position reconciliation applied");
        }
        Ok((imported, dropped))
    }

    // -------------------------------------------------------------------------
    // Price helper
    // -------------------------------------------------------------------------

    /// Live cached price, with a REST candle fallback.
    async fn current_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.exchange.current_price(symbol) {
            return Some(price);
        }
        match self.exchange.fetch_ohlcv(symbol, "1m", 1).await {
            Ok(candles) => candles.last().map(|c| c.close),
            Err(e) => {
                warn!(symbol, error = %e, "REST price fallback failed");
                None
            }
        }
    }
}

/// Round to the symbol's quote precision (decimal places).
fn round_price(price: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (price * factor).round() / factor
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.open.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::spec_defaults;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::{ExchangePosition, ExchangeResult, Order};
    use crate::market_data::LiveCache;
    use crate::signal::{ComponentScores, MarketRegime};
    use crate::store::MemoryStore;
    use crate::types::Direction;
    use async_trait::async_trait;

    struct NullPort;

    #[async_trait]
    impl ExchangePort for NullPort {
        async fn fetch_ohlcv(&self, _: &str, _: &str, _: u32) -> ExchangeResult<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn fetch_balance(
            &self,
        ) -> ExchangeResult<std::collections::HashMap<String, crate::types::BalanceInfo>> {
            Ok(Default::default())
        }
        async fn fetch_positions(
            &self,
            _: Option<&str>,
        ) -> ExchangeResult<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }
        async fn place_order(&self, _: &OrderRequest) -> ExchangeResult<Order> {
            Err(crate::exchange::ExchangeError::Network("null".into()))
        }
        async fn cancel_order(&self, _: &str, _: &str) -> ExchangeResult<()> {
            Ok(())
        }
        async fn set_leverage(&self, _: &str, _: u32) -> ExchangeResult<()> {
            Ok(())
        }
        fn current_price(&self, _: &str) -> Option<f64> {
            None
        }
    }

    struct Harness {
        manager: PositionManager,
        live: Arc<LiveCache>,
        store: Arc<MemoryStore>,
    }

    fn harness(symbol: &str, price: f64) -> Harness {
        let live = Arc::new(LiveCache::new());
        live.set_price(symbol, price);
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(PaperExchange::new(Arc::new(NullPort), live.clone()));
        let manager = PositionManager {
            exchange,
            store: store.clone(),
            notifier: Notifier::new(),
            taker_fee: 0.0006,
            open: RwLock::new(HashMap::new()),
            symbol_locks: RwLock::new(HashMap::new()),
            atr_state: RwLock::new(HashMap::new()),
        };
        Harness {
            manager,
            live,
            store,
        }
    }

    fn long_signal(symbol: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            score: 0.60,
            confidence: 80.0,
            component_scores: ComponentScores::default(),
            regime: MarketRegime::TrendingUp,
            alignment_score: 1.0,
            expected_move: 0.01,
            stop_pct: 0.01,
            target_pct: 0.02,
            position_size_multiplier: 1.0,
            should_trade: true,
        }
    }

    #[tokio::test]
    async fn open_creates_position_trade_and_stop() {
        let h = harness("BTCUSDT", 40_000.0);
        let mut spec = spec_defaults("BTCUSDT");
        spec.leverage = 20;

        let position = h
            .manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        assert_eq!(position.side, PositionSide::Long);
        assert!(position.quantity > 0.0);
        assert!(position.stop_order_id.is_some());
        // Stop near entry x 0.99.
        assert!((position.stop_loss - 40_000.0 * 0.99).abs() < 1.0);
        assert_eq!(position.take_profits.len(), 2);

        // Persisted both halves.
        assert_eq!(h.store.list_open_positions(None).unwrap().len(), 1);
        assert_eq!(h.store.list_trades(Some("BTCUSDT"), 10).unwrap().len(), 1);
        assert_eq!(h.manager.open_positions_for("BTCUSDT").len(), 1);
    }

    #[tokio::test]
    async fn manage_is_noop_without_movement() {
        let h = harness("BTCUSDT", 40_000.0);
        let spec = spec_defaults("BTCUSDT");
        let position = h
            .manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        h.manager.manage_symbol(&spec, None).await.unwrap();

        let after = h.manager.open_positions_for("BTCUSDT");
        assert_eq!(after.len(), 1);
        let p = &after[0];
        assert_eq!(p.quantity, position.quantity);
        assert_eq!(p.stop_loss, position.stop_loss);
        assert!(!p.trailing_active);
        assert!(p.take_profits.iter().all(|tp| !tp.executed));
    }

    #[tokio::test]
    async fn trailing_activates_and_ratchets_then_closes() {
        let h = harness("BTCUSDT", 40_000.0);
        let spec = spec_defaults("BTCUSDT"); // trailing: activate 1 %, distance 0.5 %
        h.manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        // +1.2 %: trailing activates, stop at price x 0.995.
        h.live.set_price("BTCUSDT", 40_480.0);
        h.manager.manage_symbol(&spec, None).await.unwrap();
        let p = &h.manager.open_positions_for("BTCUSDT")[0];
        assert!(p.trailing_active);
        let stop_after_activation = p.trailing_stop.unwrap();
        assert!((stop_after_activation - 40_480.0 * 0.995).abs() < 1.0);

        // Price pushes higher: stop ratchets.
        h.live.set_price("BTCUSDT", 40_800.0);
        h.manager.manage_symbol(&spec, None).await.unwrap();
        let p = &h.manager.open_positions_for("BTCUSDT")[0];
        let ratcheted = p.trailing_stop.unwrap();
        assert!(ratcheted > stop_after_activation);

        // Retrace through the trail: closed with positive pnl.
        h.live.set_price("BTCUSDT", ratcheted - 5.0);
        h.manager.manage_symbol(&spec, None).await.unwrap();
        assert!(h.manager.open_positions_for("BTCUSDT").is_empty());

        let trades = h.store.list_trades(Some("BTCUSDT"), 10).unwrap();
        assert_eq!(trades[0].close_reason, Some(CloseReason::TrailingStop));
        assert!(trades[0].pnl > 0.0, "pnl {}", trades[0].pnl);
    }

    #[tokio::test]
    async fn partial_take_profit_reduces_quantity() {
        let h = harness("BTCUSDT", 40_000.0);
        let spec = spec_defaults("BTCUSDT");
        let opened = h
            .manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        // Cross the first TP (entry x 1.01) but stay below trailing impact.
        let tp1 = opened.take_profits[0].price;
        h.live.set_price("BTCUSDT", tp1 + 1.0);
        h.manager.manage_symbol(&spec, None).await.unwrap();

        let open = h.manager.open_positions_for("BTCUSDT");
        // Position may have closed via trailing later; at minimum TP1 fired.
        if let Some(p) = open.first() {
            assert!(p.take_profits[0].executed);
            assert!(p.quantity < opened.quantity);
            assert!(p.realized_pnl > 0.0);
        }
    }

    #[tokio::test]
    async fn stop_loss_close_books_loss() {
        let h = harness("BTCUSDT", 40_000.0);
        let spec = spec_defaults("BTCUSDT");
        h.manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        // Crash through the stop.
        h.live.set_price("BTCUSDT", 39_000.0);
        h.manager.manage_symbol(&spec, None).await.unwrap();

        assert!(h.manager.open_positions_for("BTCUSDT").is_empty());
        let trades = h.store.list_trades(Some("BTCUSDT"), 10).unwrap();
        assert!(matches!(
            trades[0].close_reason,
            Some(CloseReason::StopLoss) | Some(CloseReason::EarlyStop)
        ));
        assert!(trades[0].pnl < 0.0);

        // Kelly fed with the loss.
        let kelly = h.store.get_kelly_stats("BTCUSDT").unwrap().unwrap();
        assert_eq!(kelly.losses, 1);
    }

    #[tokio::test]
    async fn emergency_close_all() {
        let h = harness("ETHUSDT", 2_000.0);
        let spec = spec_defaults("ETHUSDT");
        let mut signal = long_signal("ETHUSDT");
        signal.symbol = "ETHUSDT".into();

        h.manager.open(&spec, &signal, 300.0).await.unwrap();
        h.manager.open(&spec, &signal, 300.0).await.unwrap();
        assert_eq!(h.manager.open_positions_for("ETHUSDT").len(), 2);

        let closed = h
            .manager
            .close_all_for_symbol("ETHUSDT", CloseReason::Emergency)
            .await
            .unwrap();
        assert_eq!(closed, 2);
        assert!(h.manager.open_positions_for("ETHUSDT").is_empty());

        let trades = h.store.list_trades(Some("ETHUSDT"), 10).unwrap();
        assert!(trades
            .iter()
            .all(|t| t.close_reason == Some(CloseReason::Emergency)));
    }

    #[tokio::test]
    async fn reconcile_imports_and_discards() {
        let h = harness("BTCUSDT", 40_000.0);
        let spec = spec_defaults("BTCUSDT");

        // One position opened normally (in memory + store).
        h.manager
            .open(&spec, &long_signal("BTCUSDT"), 500.0)
            .await
            .unwrap();

        // One position only in the store (e.g. from a previous run).
        let db_only = Position::open(
            "BTCUSDT",
            PositionSide::Long,
            0.1,
            39_000.0,
            10,
            38_600.0,
            Vec::new(),
            "old-trade".into(),
        );
        h.store.add_position(&db_only).unwrap();

        // One ghost only in memory.
        let ghost = Position::open(
            "BTCUSDT",
            PositionSide::Short,
            0.2,
            41_000.0,
            10,
            41_400.0,
            Vec::new(),
            "ghost".into(),
        );
        h.manager
            .open
            .write()
            .insert(ghost.id.clone(), ghost.clone());

        let (imported, dropped) = h.manager.reconcile().unwrap();
        assert_eq!(imported, 1);
        assert_eq!(dropped, 1);

        let open = h.manager.open_positions();
        assert_eq!(open.len(), 2);
        assert!(open.iter().any(|p| p.id == db_only.id));
        assert!(!open.iter().any(|p| p.id == ghost.id));
    }

    #[tokio::test]
    async fn zero_quantity_allocation_is_refused() {
        let h = harness("BTCUSDT", 40_000.0);
        let mut spec = spec_defaults("BTCUSDT");
        spec.lot_size = 1.0; // one contract = 40 000 notional
        spec.leverage = 1;

        let err = h
            .manager
            .open(&spec, &long_signal("BTCUSDT"), 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
    }
}
