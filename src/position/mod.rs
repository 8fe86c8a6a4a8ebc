// =============================================================================
// Position model — leveraged perp position with staged exits
// =============================================================================
//
// Life-cycle: Open -> Closed, exactly once. Partial take-profits reduce
// `quantity` in place without changing status; the remainder is handled by
// the stop, the trailing stop, or the early-exit guard. Take-profit size
// fractions need not sum to 1.
//
// Only the PositionManager mutates positions (through the Store); everything
// else reads clones.
// =============================================================================

pub mod manager;

pub use manager::PositionManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TrailingParams;
use crate::types::{Direction, Side};

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Wire side that opens this position.
    pub fn entry_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// Wire side that reduces / closes this position.
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    pub fn from_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(Self::Long),
            Direction::Short => Some(Self::Short),
            Direction::Neutral => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            other => Err(format!("unknown position side {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status / close reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    EarlyStop,
    Emergency,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::TrailingStop => "trailing_stop",
            Self::EarlyStop => "early_stop",
            Self::Emergency => "emergency",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Take-profit levels
// ---------------------------------------------------------------------------

/// One staged take-profit target. `size_fraction` is relative to the
/// ORIGINAL quantity; fractions across levels need not sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: f64,
    pub size_fraction: f64,
    pub executed: bool,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    /// Remaining open quantity in contracts.
    pub quantity: f64,
    /// Quantity at open (partial exits do not change this).
    pub initial_quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    pub trailing_active: bool,
    pub trailing_stop: Option<f64>,
    /// Best profit percentage observed over the life of the position.
    pub max_profit_pct_seen: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Ledger trade row this position settles into.
    pub trade_id: String,
    /// Resting stop order on the venue, when placement succeeded.
    pub stop_order_id: Option<String>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: f64,
}

/// Outcome of one trailing-stop evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingUpdate {
    /// Still below the activation threshold.
    Inactive,
    /// Activated this evaluation; stop initialised.
    Activated(f64),
    /// Already active; stop ratcheted to a tighter level.
    Moved(f64),
    /// Already active; current stop still the tightest seen.
    Unchanged,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        leverage: u32,
        stop_loss: f64,
        take_profits: Vec<TakeProfitLevel>,
        trade_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            initial_quantity: quantity,
            entry_price,
            leverage,
            stop_loss,
            take_profits,
            trailing_active: false,
            trailing_stop: None,
            max_profit_pct_seen: 0.0,
            opened_at: Utc::now(),
            closed_at: None,
            trade_id,
            stop_order_id: None,
            status: PositionStatus::Open,
            close_reason: None,
            realized_pnl: 0.0,
        }
    }

    /// Unleveraged profit fraction at `price` (0.01 = 1 % move in favour).
    pub fn profit_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }

    /// Margin locked by this position (notional / leverage).
    pub fn margin_used(&self, price: f64) -> f64 {
        if self.leverage == 0 {
            return 0.0;
        }
        (self.quantity * price) / self.leverage as f64
    }

    /// Step 2 of the manage loop: track the best profit seen.
    pub fn note_price(&mut self, price: f64) {
        let pct = self.profit_pct(price);
        if pct > self.max_profit_pct_seen {
            self.max_profit_pct_seen = pct;
        }
    }

    /// Trailing-stop state machine (manage-loop step 3).
    ///
    /// Activation uses a CLOSED boundary: exactly at `activation` the trail
    /// turns on. Once active the stop only ever moves in the profitable
    /// direction.
    pub fn update_trailing(&mut self, price: f64, params: &TrailingParams) -> TrailingUpdate {
        let profit = self.profit_pct(price);

        if !self.trailing_active {
            if profit >= params.activation {
                let stop = self.trailing_stop_at(price, params.distance);
                self.trailing_active = true;
                self.trailing_stop = Some(stop);
                self.stop_loss = tighter_stop(self.side, self.stop_loss, stop);
                return TrailingUpdate::Activated(stop);
            }
            return TrailingUpdate::Inactive;
        }

        let candidate = self.trailing_stop_at(price, params.distance);
        let current = self.trailing_stop.unwrap_or(self.stop_loss);
        let improves = match self.side {
            PositionSide::Long => candidate > current,
            PositionSide::Short => candidate < current,
        };
        if improves {
            self.trailing_stop = Some(candidate);
            self.stop_loss = tighter_stop(self.side, self.stop_loss, candidate);
            TrailingUpdate::Moved(candidate)
        } else {
            TrailingUpdate::Unchanged
        }
    }

    fn trailing_stop_at(&self, price: f64, distance: f64) -> f64 {
        match self.side {
            PositionSide::Long => price * (1.0 - distance),
            PositionSide::Short => price * (1.0 + distance),
        }
    }

    /// `true` when `price` has crossed the effective stop (trailing stop when
    /// active, else the fixed stop-loss).
    pub fn stop_crossed(&self, price: f64) -> bool {
        let stop = self.trailing_stop.unwrap_or(self.stop_loss);
        match self.side {
            PositionSide::Long => price <= stop,
            PositionSide::Short => price >= stop,
        }
    }

    /// Indices of unexecuted take-profit levels whose price has been crossed.
    pub fn crossed_take_profits(&self, price: f64) -> Vec<usize> {
        self.take_profits
            .iter()
            .enumerate()
            .filter(|(_, tp)| !tp.executed)
            .filter(|(_, tp)| match self.side {
                PositionSide::Long => price >= tp.price,
                PositionSide::Short => price <= tp.price,
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Transition to Closed. Panics in debug builds if called twice — the
    /// open -> closed transition happens exactly once.
    pub fn mark_closed(&mut self, reason: CloseReason, realized_pnl: f64) {
        debug_assert_eq!(self.status, PositionStatus::Open, "double close of {}", self.id);
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(Utc::now());
        self.realized_pnl += realized_pnl;
        self.quantity = 0.0;
    }
}

/// The tighter of two stops for the given side (never loosens).
fn tighter_stop(side: PositionSide, current: f64, candidate: f64) -> f64 {
    match side {
        PositionSide::Long => current.max(candidate),
        PositionSide::Short => current.min(candidate),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::open(
            "BTCUSDT",
            PositionSide::Long,
            1.0,
            100.0,
            20,
            99.0,
            vec![
                TakeProfitLevel {
                    price: 102.0,
                    size_fraction: 0.5,
                    executed: false,
                },
                TakeProfitLevel {
                    price: 104.0,
                    size_fraction: 0.3,
                    executed: false,
                },
            ],
            "trade-1".into(),
        )
    }

    fn params() -> TrailingParams {
        TrailingParams {
            activation: 0.01,
            distance: 0.005,
        }
    }

    #[test]
    fn profit_pct_signed_by_side() {
        let long = long_position();
        assert!((long.profit_pct(101.0) - 0.01).abs() < 1e-12);
        assert!((long.profit_pct(99.0) + 0.01).abs() < 1e-12);

        let mut short = long_position();
        short.side = PositionSide::Short;
        assert!((short.profit_pct(99.0) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn trailing_activates_exactly_at_boundary() {
        let mut pos = long_position();
        // Just below activation: inactive.
        assert_eq!(pos.update_trailing(100.99, &params()), TrailingUpdate::Inactive);
        assert!(!pos.trailing_active);

        // Exactly at activation (closed boundary): active.
        let update = pos.update_trailing(101.0, &params());
        assert!(matches!(update, TrailingUpdate::Activated(_)));
        assert!(pos.trailing_active);
        let stop = pos.trailing_stop.unwrap();
        assert!((stop - 101.0 * 0.995).abs() < 1e-9);
    }

    #[test]
    fn trailing_is_monotonic_for_longs() {
        let mut pos = long_position();
        pos.update_trailing(101.2, &params());
        let first = pos.trailing_stop.unwrap();

        // Price rises -> stop ratchets up.
        assert!(matches!(
            pos.update_trailing(102.0, &params()),
            TrailingUpdate::Moved(_)
        ));
        let second = pos.trailing_stop.unwrap();
        assert!(second > first);

        // Price retraces -> stop never loosens.
        assert_eq!(pos.update_trailing(101.0, &params()), TrailingUpdate::Unchanged);
        assert_eq!(pos.trailing_stop, Some(second));
    }

    #[test]
    fn trailing_is_monotonic_for_shorts() {
        let mut pos = long_position();
        pos.side = PositionSide::Short;
        pos.stop_loss = 101.0;

        pos.update_trailing(98.9, &params());
        let first = pos.trailing_stop.unwrap();
        pos.update_trailing(98.0, &params());
        let second = pos.trailing_stop.unwrap();
        assert!(second < first);

        pos.update_trailing(98.5, &params());
        assert_eq!(pos.trailing_stop, Some(second));
    }

    #[test]
    fn stop_crossed_uses_trailing_when_active() {
        let mut pos = long_position();
        assert!(!pos.stop_crossed(99.5)); // above fixed stop
        assert!(pos.stop_crossed(99.0)); // at fixed stop

        pos.update_trailing(102.0, &params());
        let trail = pos.trailing_stop.unwrap();
        assert!(pos.stop_crossed(trail - 0.01));
        assert!(!pos.stop_crossed(trail + 0.01));
    }

    #[test]
    fn crossed_take_profits_in_order() {
        let pos = long_position();
        assert!(pos.crossed_take_profits(101.0).is_empty());
        assert_eq!(pos.crossed_take_profits(102.5), vec![0]);
        assert_eq!(pos.crossed_take_profits(105.0), vec![0, 1]);
    }

    #[test]
    fn executed_levels_are_skipped() {
        let mut pos = long_position();
        pos.take_profits[0].executed = true;
        assert_eq!(pos.crossed_take_profits(105.0), vec![1]);
    }

    #[test]
    fn note_price_tracks_best_profit_only() {
        let mut pos = long_position();
        pos.note_price(103.0);
        assert!((pos.max_profit_pct_seen - 0.03).abs() < 1e-12);
        pos.note_price(101.0);
        assert!((pos.max_profit_pct_seen - 0.03).abs() < 1e-12);
    }

    #[test]
    fn close_is_terminal() {
        let mut pos = long_position();
        pos.mark_closed(CloseReason::TrailingStop, 12.5);
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.quantity, 0.0);
        assert!(pos.closed_at.unwrap() >= pos.opened_at);
        assert_eq!(pos.close_reason, Some(CloseReason::TrailingStop));
    }

    #[test]
    fn margin_used_divides_by_leverage() {
        let pos = long_position();
        assert!((pos.margin_used(100.0) - 5.0).abs() < 1e-12);
    }
}
