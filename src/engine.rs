// =============================================================================
// Engine Loop — one cycle of the trading clock
// =============================================================================
//
// Per cycle:
//   1. backfill ML prediction outcomes older than the horizon
//   2. reconcile positions (store <-> memory)
//   3. one news assessment shared by every symbol
//   4. per symbol, in configured order:
//        a. min-interval skip
//        b. risk-gate pre-checks
//        c. signal evaluation
//        d. emergency path: close all, alert, skip the symbol this cycle
//        e. entry via capital allocation + position manager
//        f. manage pass (always)
//   5. performance logging, then sleep until the next cycle
//
// Cancellation is cooperative: the shutdown signal is checked between
// stages, and no new orders start once it fires. Open positions are never
// auto-closed on shutdown.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::news::NewsAssessment;
use crate::notify::{MessageClass, Notification, Priority};
use crate::position::CloseReason;
use crate::signal::fusion::SymbolWindows;
use crate::store::SignalPrediction;
use crate::types::EngineMode;

/// Candle depth requested per timeframe window.
const WINDOW_LIMIT: u32 = 300;
/// Minimum time between two analyses of the same symbol.
const MIN_ANALYSIS_INTERVAL: Duration = Duration::from_secs(60);
/// Age in hours at which an unresolved prediction gets its outcome
/// backfilled.
const PREDICTION_HORIZON_HOURS: i64 = 1;

pub struct Engine {
    state: Arc<AppState>,
    last_analysis: HashMap<String, Instant>,
}

impl Engine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            last_analysis: HashMap::new(),
        }
    }

    /// Run cycles until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.state.config.trading_cycle_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "engine loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("engine loop stopped");
                    return;
                }
            }

            if *self.state.mode.read() != EngineMode::Running {
                debug!("engine stopped — skipping cycle");
                continue;
            }

            let started = Instant::now();
            self.run_cycle(&shutdown).await;
            self.state.record_cycle();
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                cycle = self.state.cycles(),
                "cycle complete"
            );
        }
    }

    async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) {
        let state = self.state.clone();

        // ── 1. Prediction outcome backfill ──────────────────────────────
        self.backfill_prediction_outcomes();
        if *shutdown.borrow() {
            return;
        }

        // ── 2. Reconciliation ───────────────────────────────────────────
        if let Err(e) = state.positions.reconcile() {
            self.record_failure("position_manager", &e);
        }
        if *shutdown.borrow() {
            return;
        }

        // ── Balance for gating and sizing ───────────────────────────────
        let balance = self.refresh_balance().await;

        // ── 3. News assessment (one per cycle) ──────────────────────────
        let news = state.news.assess().await;
        if *shutdown.borrow() {
            return;
        }

        // ── 4. Per-symbol pipeline ──────────────────────────────────────
        let mut signals = Vec::new();
        for symbol in state.config.symbols.clone() {
            if *shutdown.borrow() {
                break;
            }
            match self.process_symbol(&symbol, balance, &news).await {
                Ok(Some(signal)) => signals.push(signal),
                Ok(None) => {}
                Err(e) => self.handle_symbol_error(&symbol, e),
            }
        }
        *state.last_signals.write() = signals;

        // ── 5. Performance aggregates ───────────────────────────────────
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if let Ok(Some(perf)) = state.store.get_daily_performance(&today) {
            debug!(
                trades = perf.trades,
                pnl = perf.pnl,
                win_rate = ?perf.win_rate(),
                "daily performance"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Per-symbol pipeline
    // -------------------------------------------------------------------------

    async fn process_symbol(
        &mut self,
        symbol: &str,
        balance: f64,
        news: &NewsAssessment,
    ) -> Result<Option<crate::signal::Signal>, EngineError> {
        let state = self.state.clone();
        let spec = state.config.spec(symbol)?.clone();

        // a. Min analysis interval.
        if let Some(last) = self.last_analysis.get(symbol) {
            if last.elapsed() < MIN_ANALYSIS_INTERVAL {
                // Still run the manage pass for open positions.
                state.positions.manage_symbol(&spec, None).await?;
                return Ok(None);
            }
        }
        self.last_analysis.insert(symbol.to_string(), Instant::now());

        // b. Risk gate: a blocked symbol skips analysis but still gets its
        //    manage pass.
        let open_positions = state.positions.open_positions();
        let verdict = state
            .risk_gate
            .pre_trade_check(symbol, &spec, balance, &open_positions);
        if let crate::risk::RiskVerdict::Blocked { check, reason } = &verdict {
            let _ = state.store.append_system_event(
                "info",
                "risk",
                reason,
                serde_json::json!({ "symbol": symbol, "check": check }),
            );
            state.positions.manage_symbol(&spec, None).await?;
            return Ok(None);
        }

        // c. Signal evaluation.
        let windows = self.gather_windows(&spec).await?;
        let signal = state
            .signal_engine
            .evaluate(&spec, &windows, &state.ml, news);

        // d. Emergency path.
        if news.is_emergency_for(symbol) {
            warn!(
                symbol,
                severity = news.emergency_severity,
                "emergency declared — closing all positions"
            );
            let closed = state
                .positions
                .close_all_for_symbol(symbol, CloseReason::Emergency)
                .await?;
            state.notifier.send(Notification::new(
                format!(
                    "EMERGENCY on {symbol}: severity {:.2}, {closed} position(s) closed",
                    news.emergency_severity
                ),
                Priority::Emergency,
                MessageClass::Emergency,
            ));
            let _ = state.store.append_system_event(
                "critical",
                "news",
                "emergency close",
                serde_json::json!({
                    "symbol": symbol,
                    "severity": news.emergency_severity,
                    "closed": closed,
                }),
            );
            return Ok(Some(signal)); // no trading, no manage pass this cycle
        }

        // Audit the prediction for later outcome scoring.
        if let Some(price) = state.market_data.current_price(symbol) {
            let prediction = SignalPrediction {
                id: Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                score: signal.score,
                confidence: signal.confidence,
                price_at_prediction: price,
                predicted_at: Utc::now(),
                outcome_price: None,
                outcome_pnl_pct: None,
            };
            if let Err(e) = state.store.record_signal_prediction(&prediction) {
                warn!(error = %e, "failed to record signal prediction");
            }
        }

        // e. Entry.
        if signal.should_trade {
            match state.capital.allocation_for(
                &spec,
                balance,
                &state.positions.open_positions(),
                signal.position_size_multiplier,
            ) {
                Ok(allocation) => match state.positions.open(&spec, &signal, allocation).await {
                    Ok(position) => {
                        info!(symbol, id = %position.id, allocation, "entry executed");
                    }
                    Err(e) if e.is_operational() => {
                        info!(symbol, outcome = %e, "entry refused");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_operational() => {
                    info!(symbol, outcome = %e, "allocation refused");
                    let _ = state.store.append_system_event(
                        "info",
                        "capital",
                        &e.to_string(),
                        serde_json::json!({ "symbol": symbol }),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // f. Manage pass, with the 15m window for ATR re-evaluation.
        let atr_window = windows
            .windows
            .iter()
            .find(|(tf, _)| tf == "15m")
            .map(|(_, candles)| candles.clone());
        state
            .positions
            .manage_symbol(&spec, atr_window.as_deref().map(|v| v.as_slice()))
            .await?;

        Ok(Some(signal))
    }

    /// Candle windows for every configured timeframe of a symbol.
    async fn gather_windows(
        &self,
        spec: &crate::config::SymbolSpec,
    ) -> Result<SymbolWindows, EngineError> {
        let mut windows = Vec::new();
        for (timeframe, _) in &spec.timeframe_weights {
            match self
                .state
                .market_data
                .indicator_window(&spec.symbol, timeframe, WINDOW_LIMIT)
                .await
            {
                Ok(candles) => windows.push((timeframe.clone(), candles)),
                Err(e) => {
                    // insufficient_data on one timeframe suppresses the whole
                    // symbol for the cycle.
                    return Err(e);
                }
            }
        }
        Ok(SymbolWindows { windows })
    }

    // -------------------------------------------------------------------------
    // Cycle support
    // -------------------------------------------------------------------------

    /// Resolve unresolved predictions older than the horizon against the
    /// current price.
    fn backfill_prediction_outcomes(&self) {
        let state = &self.state;
        let cutoff = Utc::now() - chrono::Duration::hours(PREDICTION_HORIZON_HOURS);
        let pending = match state.store.unresolved_predictions_before(cutoff) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to list unresolved predictions");
                return;
            }
        };
        for prediction in pending {
            let Some(price) = state.market_data.current_price(&prediction.symbol) else {
                continue;
            };
            if prediction.price_at_prediction <= 0.0 {
                continue;
            }
            // Outcome is signed by the predicted direction.
            let raw_return =
                (price - prediction.price_at_prediction) / prediction.price_at_prediction;
            let pnl_pct = raw_return * prediction.score.signum();
            if let Err(e) =
                state
                    .store
                    .update_prediction_outcome(&prediction.id, price, pnl_pct)
            {
                warn!(error = %e, id = %prediction.id, "outcome update failed");
            }
        }
    }

    /// Current total balance, cached for status and the risk gate.
    async fn refresh_balance(&self) -> f64 {
        let state = &self.state;
        match state.exchange.fetch_balance().await {
            Ok(balances) => {
                let total = balances.get("USDT").map(|b| b.total).unwrap_or(0.0);
                if total > 0.0 {
                    *state.last_balance.write() = total;
                }
                total
            }
            Err(e) => {
                warn!(error = %e, "balance refresh failed — using cached value");
                *state.last_balance.read()
            }
        }
    }

    fn handle_symbol_error(&self, symbol: &str, error: EngineError) {
        let state = &self.state;
        if error.is_fatal() {
            error!(symbol, error = %error, "fatal error — halting trading");
            *state.mode.write() = EngineMode::Stopped;
            state.notifier.send(Notification::new(
                format!("FATAL: {error} — trading halted"),
                Priority::Emergency,
                MessageClass::Emergency,
            ));
        } else if error.is_operational() {
            info!(symbol, outcome = %error, "symbol skipped");
        } else {
            warn!(symbol, error = %error, "symbol skipped for this cycle");
        }
        self.record_failure("engine", &error);
    }

    fn record_failure(&self, component: &str, error: &EngineError) {
        let level = if error.is_fatal() {
            "critical"
        } else if error.is_operational() {
            "info"
        } else {
            "warn"
        };
        if let Err(e) = self.state.store.append_system_event(
            level,
            component,
            &error.to_string(),
            serde_json::json!({ "kind": error.kind() }),
        ) {
            warn!(error = %e, "failed to persist system event");
        }
    }
}

// =============================================================================
// Background: ML retrainer
// =============================================================================

/// Periodic retrain evaluation. Builds a fresh dataset from 1h candles of
/// the first configured symbol and retrains any stale head. A failed head
/// never blocks the others.
pub async fn run_ml_retrainer(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("ml retrainer stopped");
                return;
            }
        }
        if !state.config.enable_ml_models || !state.ml.should_retrain() {
            continue;
        }

        let Some(symbol) = state.config.symbols.first().cloned() else {
            continue;
        };
        let candles = match state.market_data.ohlcv(&symbol, "1h", 1000).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(error = %e, "retrainer could not fetch candles");
                continue;
            }
        };

        let dataset = tokio::task::spawn_blocking({
            let candles = candles.clone();
            move || crate::ml::build_training_dataset(&candles, 12, 4)
        })
        .await
        .unwrap_or_default();

        if dataset.is_empty() {
            continue;
        }
        let report = state.ml.train_all(&dataset);
        let trained = report.iter().filter(|(_, r)| r.is_ok()).count();
        info!(trained, total = report.len(), rows = dataset.len(), "retraining pass done");
        if let Err(e) = state.ml.save() {
            warn!(error = %e, "failed to persist models");
        }
    }
}

/// Periodic news pipeline verification (stats + cooldown pruning).
pub async fn run_news_verification(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => state.news.run_verification(),
            _ = shutdown.changed() => {
                info!("news verification loop stopped");
                return;
            }
        }
    }
}
