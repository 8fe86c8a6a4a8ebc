// =============================================================================
// Capital Tracker — allocation snapshots, alert ladder, Kelly sizing
// =============================================================================
//
// Allocation math for a prospective entry on `symbol`:
//
//   max_allowed   = total_balance x MAX_TOTAL_ALLOCATION
//   used          = sum(notional / leverage) over open positions
//   available     = max_allowed - used
//   target        = max_allowed x weight[symbol]
//   remaining     = target - used_on_symbol
//   kelly         = clamp((b*p - (1-p)) / b, 0, 0.25) x KELLY_FRACTION
//   allocation    = min(remaining, target / max_positions,
//                       remaining x kelly, available) x size_multiplier
//
// Below the minimum notional the trade is REFUSED with InsufficientFunds —
// an operational outcome, not an error.
//
// The background loop snapshots every 30 s, evaluates the alert ladder
// (warning 25 %, danger 30 %, critical 32 % of balance in use) with
// per-level cooldowns, and notifies recovery back to a safe level.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, SymbolSpec};
use crate::error::{EngineError, EngineResult};
use crate::exchange::ExchangePort;
use crate::notify::{MessageClass, Notification, Notifier, Priority};
use crate::position::Position;
use crate::store::{BalanceSnapshot, KellyStats, Store};

/// Kelly clamp ceiling before the safety fraction.
const KELLY_CAP: f64 = 0.25;
/// Minimum closed trades before Kelly output is trusted.
const KELLY_MIN_TRADES: u32 = 5;

/// Alert ladder thresholds on `allocation_pct`.
const WARNING_THRESHOLD: f64 = 0.25;
const DANGER_THRESHOLD: f64 = 0.30;
const CRITICAL_THRESHOLD: f64 = 0.32;

/// Per-level re-alert cooldowns.
const WARNING_COOLDOWN: Duration = Duration::from_secs(30 * 60);
const DANGER_COOLDOWN: Duration = Duration::from_secs(10 * 60);
const CRITICAL_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationLevel {
    Safe,
    Warning,
    Danger,
    Critical,
}

/// Point-in-time capital view.
#[derive(Debug, Clone, Serialize)]
pub struct CapitalSnapshot {
    pub total_balance: f64,
    pub used_capital: f64,
    pub available_under_cap: f64,
    /// used / total, [0, 1+].
    pub allocation_pct: f64,
    pub per_symbol_allocation: Vec<(String, f64)>,
    pub within_limit: bool,
    pub taken_at: chrono::DateTime<Utc>,
}

struct AlertState {
    level: AllocationLevel,
    last_sent: Option<(AllocationLevel, Instant)>,
}

pub struct CapitalTracker {
    exchange: Arc<dyn ExchangePort>,
    store: Arc<dyn Store>,
    notifier: Arc<Notifier>,
    max_total_allocation: f64,
    kelly_fraction: f64,
    min_notional_usd: f64,
    update_interval: Duration,
    latest: Mutex<Option<CapitalSnapshot>>,
    alerts: Mutex<AlertState>,
}

impl CapitalTracker {
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
            max_total_allocation: config.max_total_allocation,
            kelly_fraction: config.kelly_fraction,
            min_notional_usd: config.min_notional_usd,
            update_interval: Duration::from_secs(config.capital_update_interval_secs),
            latest: Mutex::new(None),
            alerts: Mutex::new(AlertState {
                level: AllocationLevel::Safe,
                last_sent: None,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Build a snapshot from the current balance and open positions.
    pub fn snapshot(&self, total_balance: f64, open_positions: &[Position]) -> CapitalSnapshot {
        let mut per_symbol: Vec<(String, f64)> = Vec::new();
        let mut used = 0.0;
        for position in open_positions {
            let margin = position.margin_used(position.entry_price);
            used += margin;
            match per_symbol.iter_mut().find(|(s, _)| *s == position.symbol) {
                Some((_, v)) => *v += margin,
                None => per_symbol.push((position.symbol.clone(), margin)),
            }
        }

        let max_allowed = total_balance * self.max_total_allocation;
        let snapshot = CapitalSnapshot {
            total_balance,
            used_capital: used,
            available_under_cap: (max_allowed - used).max(0.0),
            allocation_pct: if total_balance > 0.0 {
                used / total_balance
            } else {
                0.0
            },
            per_symbol_allocation: per_symbol,
            within_limit: used <= max_allowed,
            taken_at: Utc::now(),
        };
        *self.latest.lock() = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<CapitalSnapshot> {
        self.latest.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Capital to deploy for a new entry, or `InsufficientFunds` when the
    /// final figure falls below the minimum notional.
    pub fn allocation_for(
        &self,
        spec: &SymbolSpec,
        total_balance: f64,
        open_positions: &[Position],
        size_multiplier: f64,
    ) -> EngineResult<f64> {
        let snapshot = self.snapshot(total_balance, open_positions);
        let max_allowed = total_balance * self.max_total_allocation;

        let target_symbol_allocation = max_allowed * spec.portfolio_weight;
        let used_on_symbol = snapshot
            .per_symbol_allocation
            .iter()
            .find(|(s, _)| s == &spec.symbol)
            .map(|(_, v)| *v)
            .unwrap_or(0.0);
        let remaining = (target_symbol_allocation - used_on_symbol).max(0.0);

        let kelly = self.safe_kelly(&spec.symbol);
        let per_position = target_symbol_allocation / spec.max_positions.max(1) as f64;

        let mut allocation = remaining
            .min(per_position)
            .min(remaining * kelly.unwrap_or(1.0))
            .min(snapshot.available_under_cap);
        allocation *= size_multiplier;

        debug!(
            symbol = %spec.symbol,
            allocation,
            remaining,
            per_position,
            kelly = ?kelly,
            available = snapshot.available_under_cap,
            "allocation computed"
        );

        if allocation < self.min_notional_usd {
            return Err(EngineError::InsufficientFunds(format!(
                "allocation {allocation:.2} below minimum notional {:.2}",
                self.min_notional_usd
            )));
        }
        Ok(allocation)
    }

    /// Fractional Kelly from the symbol's ledger stats. `None` when history
    /// is too thin (caller then sizes by the weight/position caps alone).
    pub fn safe_kelly(&self, symbol: &str) -> Option<f64> {
        let stats = match self.store.get_kelly_stats(symbol) {
            Ok(Some(stats)) => stats,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, symbol, "failed to read kelly stats");
                return None;
            }
        };
        kelly_fraction_from(&stats, self.kelly_fraction)
    }

    // -------------------------------------------------------------------------
    // Background loop
    // -------------------------------------------------------------------------

    /// Periodic snapshot + alert evaluation until shutdown.
    pub async fn run(
        self: Arc<Self>,
        open_positions: impl Fn() -> Vec<Position> + Send + Sync + 'static,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("capital tracker stopped");
                    return;
                }
            }

            let balance = match self.exchange.fetch_balance().await {
                Ok(balances) => balances.get("USDT").map(|b| b.total).unwrap_or(0.0),
                Err(e) => {
                    warn!(error = %e, "balance fetch failed — using last stored snapshot");
                    match self.store.latest_balance() {
                        Ok(Some(snap)) => snap.total,
                        _ => continue,
                    }
                }
            };

            let positions = open_positions();
            let snapshot = self.snapshot(balance, &positions);

            if let Err(e) = self.store.add_balance_snapshot(&BalanceSnapshot {
                total: snapshot.total_balance,
                available: snapshot.available_under_cap,
                taken_at: snapshot.taken_at,
            }) {
                warn!(error = %e, "failed to persist balance snapshot");
            }

            self.evaluate_alerts(&snapshot);
        }
    }

    /// Alert ladder with per-level cooldowns and safe-level recovery.
    fn evaluate_alerts(&self, snapshot: &CapitalSnapshot) {
        let level = if snapshot.allocation_pct >= CRITICAL_THRESHOLD {
            AllocationLevel::Critical
        } else if snapshot.allocation_pct >= DANGER_THRESHOLD {
            AllocationLevel::Danger
        } else if snapshot.allocation_pct >= WARNING_THRESHOLD {
            AllocationLevel::Warning
        } else {
            AllocationLevel::Safe
        };

        let mut alerts = self.alerts.lock();
        let previous = alerts.level;
        alerts.level = level;

        match level {
            AllocationLevel::Safe => {
                if previous != AllocationLevel::Safe {
                    self.notifier.send(Notification::new(
                        format!(
                            "Capital allocation back to safe level ({:.1}% in use)",
                            snapshot.allocation_pct * 100.0
                        ),
                        Priority::Normal,
                        MessageClass::Info,
                    ));
                    alerts.last_sent = None;
                }
            }
            _ => {
                let (cooldown, priority) = match level {
                    AllocationLevel::Critical => (CRITICAL_COOLDOWN, Priority::High),
                    AllocationLevel::Danger => (DANGER_COOLDOWN, Priority::High),
                    _ => (WARNING_COOLDOWN, Priority::Normal),
                };
                let due = match alerts.last_sent {
                    Some((sent_level, at)) => sent_level != level || at.elapsed() >= cooldown,
                    None => true,
                };
                if due {
                    self.notifier.send(
                        Notification::new(
                            format!(
                                "Capital allocation {:?}: {:.1}% of balance in use \
                                 ({:.2} of {:.2})",
                                level,
                                snapshot.allocation_pct * 100.0,
                                snapshot.used_capital,
                                snapshot.total_balance
                            ),
                            priority,
                            MessageClass::Alert,
                        )
                        .with_metadata(serde_json::json!({
                            "allocation_pct": snapshot.allocation_pct,
                            "level": format!("{level:?}"),
                        })),
                    );
                    alerts.last_sent = Some((level, Instant::now()));
                }
            }
        }
    }
}

/// kelly = (b*p - (1-p)) / b with b = avg_win / avg_loss, clamped to
/// [0, 0.25], then scaled by the safety fraction.
pub fn kelly_fraction_from(stats: &KellyStats, safety_fraction: f64) -> Option<f64> {
    if stats.trade_count() < KELLY_MIN_TRADES {
        return None;
    }
    let p = stats.win_rate()?;
    let avg_win = stats.avg_win()?;
    let avg_loss = stats.avg_loss()?;
    if avg_loss <= 0.0 {
        // No losing history: cap at the clamp ceiling.
        return Some(KELLY_CAP * safety_fraction);
    }
    let b = avg_win / avg_loss;
    if b <= 0.0 {
        return Some(0.0);
    }
    let kelly = (b * p - (1.0 - p)) / b;
    Some(kelly.clamp(0.0, KELLY_CAP) * safety_fraction)
}
