// =============================================================================
// Risk Gate — pre-trade checks protecting capital
// =============================================================================
//
// Every entry must clear ALL checks:
//
//   daily_loss       daily PnL above -DAILY_LOSS_LIMIT
//   weekly_loss      weekly PnL above -WEEKLY_LOSS_LIMIT
//   trade_count      symbol trades today below the symbol cap
//   loss_count       losing trades today below the symbol cap
//   cooldown         last entry older than the symbol cooldown
//   max_positions    open positions for the symbol below the cap
//   one_sided        no direction holds positions on every symbol
//   drawdown         drawdown from peak equity below MAX_DRAWDOWN
//
// A blocked verdict names the failing check; the engine records it as a
// structured RiskBlocked event and `/status` surfaces the check name.
// =============================================================================

pub mod capital;
pub mod stops;

pub use capital::CapitalTracker;

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::position::{Position, PositionSide};
use crate::store::Store;

/// Outcome of the pre-trade gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RiskVerdict {
    Allowed,
    Blocked {
        /// Stable check name (e.g. "daily_loss").
        check: &'static str,
        reason: String,
    },
}

impl RiskVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Derived risk view for `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskState {
    pub daily_pnl_pct: f64,
    pub weekly_pnl_pct: f64,
    pub per_symbol_trades_today: Vec<(String, u32)>,
    pub peak_equity: f64,
    pub current_drawdown: f64,
    /// Name of the most recent failing check, if any.
    pub last_blocked_check: Option<String>,
}

pub struct RiskGate {
    store: Arc<dyn Store>,
    daily_loss_limit: f64,
    weekly_loss_limit: f64,
    max_drawdown: f64,
    symbol_count: usize,
    peak_equity: RwLock<f64>,
    last_blocked: RwLock<Option<&'static str>>,
}

impl RiskGate {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            daily_loss_limit: config.daily_loss_limit,
            weekly_loss_limit: config.weekly_loss_limit,
            max_drawdown: config.max_drawdown,
            symbol_count: config.symbols.len(),
            peak_equity: RwLock::new(0.0),
            last_blocked: RwLock::new(None),
        }
    }

    /// Run every check for a prospective entry on `symbol`.
    ///
    /// `balance` is the current total equity; `open_positions` is the full
    /// open book across all symbols.
    pub fn pre_trade_check(
        &self,
        symbol: &str,
        spec: &crate::config::SymbolSpec,
        balance: f64,
        open_positions: &[Position],
    ) -> RiskVerdict {
        // Track peak equity for the drawdown check.
        {
            let mut peak = self.peak_equity.write();
            if balance > *peak {
                *peak = balance;
            }
        }

        let verdict = self.run_checks(symbol, spec, balance, open_positions);
        match &verdict {
            RiskVerdict::Allowed => {
                *self.last_blocked.write() = None;
            }
            RiskVerdict::Blocked { check, reason } => {
                *self.last_blocked.write() = Some(check);
                info!(symbol, check, reason = %reason, "entry blocked by risk gate");
            }
        }
        verdict
    }

    fn run_checks(
        &self,
        symbol: &str,
        spec: &crate::config::SymbolSpec,
        balance: f64,
        open_positions: &[Position],
    ) -> RiskVerdict {
        // --- Daily / weekly loss --------------------------------------------
        let daily_pnl_pct = self.daily_pnl_pct(balance);
        if daily_pnl_pct <= -self.daily_loss_limit {
            return RiskVerdict::Blocked {
                check: "daily_loss",
                reason: format!(
                    "daily pnl {:.2}% breaches limit -{:.2}%",
                    daily_pnl_pct * 100.0,
                    self.daily_loss_limit * 100.0
                ),
            };
        }
        let weekly_pnl_pct = self.weekly_pnl_pct(balance);
        if weekly_pnl_pct <= -self.weekly_loss_limit {
            return RiskVerdict::Blocked {
                check: "weekly_loss",
                reason: format!(
                    "weekly pnl {:.2}% breaches limit -{:.2}%",
                    weekly_pnl_pct * 100.0,
                    self.weekly_loss_limit * 100.0
                ),
            };
        }

        // --- Per-symbol counts and cooldown ---------------------------------
        let (trades_today, losses_today, last_opened_at) = self.symbol_day_stats(symbol);
        if trades_today >= spec.daily.max_trades {
            return RiskVerdict::Blocked {
                check: "trade_count",
                reason: format!("{trades_today} trades today (cap {})", spec.daily.max_trades),
            };
        }
        if losses_today >= spec.daily.max_loss_trades {
            return RiskVerdict::Blocked {
                check: "loss_count",
                reason: format!(
                    "{losses_today} losing trades today (cap {})",
                    spec.daily.max_loss_trades
                ),
            };
        }
        if let Some(last) = last_opened_at {
            let elapsed = Utc::now() - last;
            let cooldown = Duration::seconds(spec.daily.cooldown_secs as i64);
            if elapsed < cooldown {
                return RiskVerdict::Blocked {
                    check: "cooldown",
                    reason: format!(
                        "last entry {}s ago (cooldown {}s)",
                        elapsed.num_seconds(),
                        spec.daily.cooldown_secs
                    ),
                };
            }
        }

        // --- Position caps ---------------------------------------------------
        let open_for_symbol = open_positions.iter().filter(|p| p.symbol == symbol).count();
        if open_for_symbol >= spec.max_positions as usize {
            return RiskVerdict::Blocked {
                check: "max_positions",
                reason: format!(
                    "{open_for_symbol} open positions (cap {})",
                    spec.max_positions
                ),
            };
        }

        // --- One-sided portfolio --------------------------------------------
        if self.symbol_count > 0 {
            for side in [PositionSide::Long, PositionSide::Short] {
                let held = open_positions.iter().filter(|p| p.side == side).count();
                if held >= self.symbol_count {
                    return RiskVerdict::Blocked {
                        check: "one_sided",
                        reason: format!("portfolio already holds {held} {side} positions"),
                    };
                }
            }
        }

        // --- Drawdown --------------------------------------------------------
        let peak = *self.peak_equity.read();
        if peak > 0.0 {
            let drawdown = (peak - balance) / peak;
            if drawdown >= self.max_drawdown {
                return RiskVerdict::Blocked {
                    check: "drawdown",
                    reason: format!(
                        "drawdown {:.2}% breaches limit {:.2}%",
                        drawdown * 100.0,
                        self.max_drawdown * 100.0
                    ),
                };
            }
        }

        RiskVerdict::Allowed
    }

    // -------------------------------------------------------------------------
    // Derived views
    // -------------------------------------------------------------------------

    fn daily_pnl_pct(&self, balance: f64) -> f64 {
        if balance <= 0.0 {
            return 0.0;
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        match self.store.get_daily_performance(&today) {
            Ok(Some(perf)) => perf.pnl / balance,
            Ok(None) => 0.0,
            Err(e) => {
                warn!(error = %e, "failed to read daily performance — treating as flat");
                0.0
            }
        }
    }

    fn weekly_pnl_pct(&self, balance: f64) -> f64 {
        if balance <= 0.0 {
            return 0.0;
        }
        let mut pnl = 0.0;
        for days_back in 0..7 {
            let date = (Utc::now() - Duration::days(days_back))
                .format("%Y-%m-%d")
                .to_string();
            if let Ok(Some(perf)) = self.store.get_daily_performance(&date) {
                pnl += perf.pnl;
            }
        }
        pnl / balance
    }

    /// (trades today, losing trades today, latest entry time) for a symbol.
    fn symbol_day_stats(
        &self,
        symbol: &str,
    ) -> (u32, u32, Option<chrono::DateTime<Utc>>) {
        let trades = match self.store.list_trades(Some(symbol), 200) {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, symbol, "failed to list trades for risk stats");
                return (0, 0, None);
            }
        };
        let today = Utc::now().date_naive();
        let mut count = 0;
        let mut losses = 0;
        let mut last = None;
        for trade in &trades {
            if trade.opened_at.date_naive() == today {
                count += 1;
                if trade.closed_at.is_some() && trade.pnl < 0.0 {
                    losses += 1;
                }
            }
            if last.map_or(true, |l| trade.opened_at > l) {
                last = Some(trade.opened_at);
            }
        }
        (count, losses, last)
    }

    /// Snapshot for `/status`.
    pub fn state(&self, balance: f64, symbols: &[String]) -> RiskState {
        let peak = *self.peak_equity.read();
        let drawdown = if peak > 0.0 {
            ((peak - balance) / peak).max(0.0)
        } else {
            0.0
        };
        RiskState {
            daily_pnl_pct: self.daily_pnl_pct(balance),
            weekly_pnl_pct: self.weekly_pnl_pct(balance),
            per_symbol_trades_today: symbols
                .iter()
                .map(|s| (s.clone(), self.symbol_day_stats(s).0))
                .collect(),
            peak_equity: peak,
            current_drawdown: drawdown,
            last_blocked_check: self.last_blocked.read().map(|s| s.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::spec_defaults;
    use crate::position::TakeProfitLevel;
    use crate::store::{DailyPerformance, MemoryStore, TradeRecord};

    fn gate_with(store: Arc<MemoryStore>) -> RiskGate {
        RiskGate {
            store,
            daily_loss_limit: 0.05,
            weekly_loss_limit: 0.10,
            max_drawdown: 0.20,
            symbol_count: 2,
            peak_equity: RwLock::new(0.0),
            last_blocked: RwLock::new(None),
        }
    }

    fn open_position(symbol: &str, side: PositionSide) -> Position {
        Position::open(
            symbol,
            side,
            1.0,
            100.0,
            10,
            99.0,
            vec![TakeProfitLevel {
                price: 102.0,
                size_fraction: 0.5,
                executed: false,
            }],
            "t".into(),
        )
    }

    #[test]
    fn clean_slate_is_allowed() {
        let gate = gate_with(Arc::new(MemoryStore::new()));
        let spec = spec_defaults("BTCUSDT");
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 10_000.0, &[]);
        assert!(verdict.is_allowed());
    }

    #[test]
    fn daily_loss_blocks_with_check_name() {
        let store = Arc::new(MemoryStore::new());
        let today = Utc::now().format("%Y-%m-%d").to_string();
        store
            .update_daily_performance(&DailyPerformance {
                date: today,
                trades: 3,
                wins: 0,
                losses: 3,
                pnl: -510.0, // -5.1 % of 10 000
                fees: 2.0,
            })
            .unwrap();

        let gate = gate_with(store);
        let spec = spec_defaults("BTCUSDT");
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 10_000.0, &[]);
        match verdict {
            RiskVerdict::Blocked { check, .. } => assert_eq!(check, "daily_loss"),
            RiskVerdict::Allowed => panic!("expected daily_loss block"),
        }
        assert_eq!(
            gate.state(10_000.0, &["BTCUSDT".into()]).last_blocked_check,
            Some("daily_loss".to_string())
        );
    }

    #[test]
    fn cooldown_blocks_recent_entries() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_trade(&TradeRecord {
                id: "t1".into(),
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                quantity: 1.0,
                entry_price: 100.0,
                exit_price: None,
                pnl: 0.0,
                pnl_pct: 0.0,
                fees: 0.0,
                close_reason: None,
                opened_at: Utc::now() - Duration::seconds(60),
                closed_at: None,
            })
            .unwrap();

        let gate = gate_with(store);
        let spec = spec_defaults("BTCUSDT"); // cooldown 1800 s
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 10_000.0, &[]);
        match verdict {
            RiskVerdict::Blocked { check, .. } => assert_eq!(check, "cooldown"),
            RiskVerdict::Allowed => panic!("expected cooldown block"),
        }
    }

    #[test]
    fn max_positions_blocks() {
        let gate = gate_with(Arc::new(MemoryStore::new()));
        let spec = spec_defaults("BTCUSDT"); // max_positions 2
        let open = vec![
            open_position("BTCUSDT", PositionSide::Long),
            open_position("BTCUSDT", PositionSide::Long),
        ];
        // Avoid the one_sided check dominating: 2 longs across 2 symbols
        // would also trip it, so check ordering puts max_positions first.
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 10_000.0, &open);
        match verdict {
            RiskVerdict::Blocked { check, .. } => assert_eq!(check, "max_positions"),
            RiskVerdict::Allowed => panic!("expected max_positions block"),
        }
    }

    #[test]
    fn one_sided_portfolio_blocks() {
        let gate = gate_with(Arc::new(MemoryStore::new()));
        let spec = spec_defaults("BTCUSDT");
        // Longs on both configured symbols; a third long anywhere is blocked.
        let open = vec![
            open_position("ETHUSDT", PositionSide::Long),
            open_position("SOLUSDT", PositionSide::Long),
        ];
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 10_000.0, &open);
        match verdict {
            RiskVerdict::Blocked { check, .. } => assert_eq!(check, "one_sided"),
            RiskVerdict::Allowed => panic!("expected one_sided block"),
        }
    }

    #[test]
    fn drawdown_blocks_after_peak_decay() {
        let gate = gate_with(Arc::new(MemoryStore::new()));
        let spec = spec_defaults("BTCUSDT");
        // Establish a peak, then drop 25 %.
        assert!(gate
            .pre_trade_check("BTCUSDT", &spec, 10_000.0, &[])
            .is_allowed());
        let verdict = gate.pre_trade_check("BTCUSDT", &spec, 7_500.0, &[]);
        match verdict {
            RiskVerdict::Blocked { check, .. } => assert_eq!(check, "drawdown"),
            RiskVerdict::Allowed => panic!("expected drawdown block"),
        }
    }
}
