// =============================================================================
// Signal Engine — per-symbol multi-timeframe analysis to one fused signal
// =============================================================================
//
// Pipeline per symbol per cycle:
//
//   candles ──▶ strategy per timeframe ──▶ MTF combine ──┐
//   indicators ──▶ regime classifier ─────────────────────┤
//   candles + indicators ──▶ pattern detector ────────────┼──▶ fusion ──▶ Signal
//   features ──▶ ML ensemble ─────────────────────────────┤
//   news assessment ──────────────────────────────────────┘
//
// Everything here is CPU-only and side-effect-free; the engine loop owns the
// I/O around it.
// =============================================================================

pub mod fusion;
pub mod mtf;
pub mod patterns;
pub mod regime;
pub mod strategy;

pub use fusion::SignalEngine;
pub use regime::{MarketRegime, RegimeSnapshot};

use serde::Serialize;

use crate::types::Direction;

/// Per-component raw scores carried on the final signal for audit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComponentScores {
    pub mtf: f64,
    pub regime: f64,
    pub patterns: f64,
    pub ml: f64,
    pub news: f64,
}

/// The fused, per-symbol, per-cycle signal.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    /// Fused score in [-1, 1].
    pub score: f64,
    /// Fused confidence in [0, 100].
    pub confidence: f64,
    pub component_scores: ComponentScores,
    pub regime: MarketRegime,
    /// Fraction of timeframe weight agreeing on the direction, [0, 1].
    pub alignment_score: f64,
    /// Expected move magnitude from the pattern detector (fraction).
    pub expected_move: f64,
    /// Stop distance as a fraction of price (ATR-derived or fallback).
    pub stop_pct: f64,
    /// Target distance as a fraction of price.
    pub target_pct: f64,
    /// Size multiplier from the regime parameter pack.
    pub position_size_multiplier: f64,
    /// Entry gate outcome (threshold + confidence + alignment).
    pub should_trade: bool,
}

impl Signal {
    /// Neutral no-trade signal (insufficient data, suppressed cycle).
    pub fn neutral(symbol: &str, regime: MarketRegime) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction: Direction::Neutral,
            score: 0.0,
            confidence: 0.0,
            component_scores: ComponentScores::default(),
            regime,
            alignment_score: 0.0,
            expected_move: 0.0,
            stop_pct: 0.0,
            target_pct: 0.0,
            position_size_multiplier: 1.0,
            should_trade: false,
        }
    }
}

/// One timeframe's verdict from a strategy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimeframeVerdict {
    pub direction: Direction,
    /// [-1, 1]
    pub score: f64,
    /// [0, 100]
    pub confidence: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_signal_never_trades() {
        let signal = Signal::neutral("BTCUSDT", MarketRegime::Ranging);
        assert!(!signal.should_trade);
        assert_eq!(signal.direction, Direction::Neutral);
        assert_eq!(signal.score, 0.0);
    }
}
