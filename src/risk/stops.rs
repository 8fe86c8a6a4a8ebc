// =============================================================================
// ATR stop / target generation
// =============================================================================
//
//   stop   = clamp(ATR x stop_mult / price, min_stop, max_stop)
//   target = ATR x target_mult / price
//
// Leverage validation: the levered loss at the stop
// (stop_distance x leverage) must not exceed MAX_LOSS_PER_POSITION. A
// violating stop is tightened to 0.7 / leverage and the target is rescaled
// proportionally. When ATR is unavailable the symbol's fallback percentages
// apply unchanged.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::SymbolSpec;
use crate::indicators::atr::atr_latest;
use crate::market_data::Candle;

/// Levered-loss ceiling used when validating stops (fraction of margin).
pub const DEFAULT_MAX_LOSS_PER_POSITION: f64 = 0.8;
/// Tightened stop numerator when the ceiling is violated.
const TIGHTENED_LOSS: f64 = 0.7;

/// Stop/target distances as fractions of price.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StopTarget {
    pub stop_pct: f64,
    pub target_pct: f64,
    /// `true` when the ATR path produced the distances (false = fallback).
    pub from_atr: bool,
}

/// Compute stop/target for an entry. `regime_stop_mult`/`regime_target_mult`
/// come from the regime parameter pack and scale the symbol's base
/// multipliers.
pub fn compute(
    spec: &SymbolSpec,
    candles: &[Candle],
    price: f64,
    regime_stop_mult: f64,
    regime_target_mult: f64,
    max_loss_per_position: f64,
) -> StopTarget {
    let atr = atr_latest(candles, spec.atr.period).filter(|a| a.is_finite() && *a > 0.0);

    let (mut stop_pct, mut target_pct, from_atr) = match atr {
        Some(atr) if price > 0.0 => {
            let stop = (atr * spec.atr.stop_multiplier * regime_stop_mult / price)
                .clamp(spec.atr.min_stop_distance, spec.atr.max_stop_distance);
            let target = atr * spec.atr.target_multiplier * regime_target_mult / price;
            (stop, target, true)
        }
        _ => (spec.fallback_stop_pct, spec.fallback_target_pct, false),
    };

    // Leverage validation.
    let leverage = spec.leverage.max(1) as f64;
    let levered_loss = stop_pct * leverage;
    if levered_loss > max_loss_per_position {
        let tightened = TIGHTENED_LOSS / leverage;
        let scale = tightened / stop_pct;
        debug!(
            symbol = %spec.symbol,
            stop_pct,
            tightened,
            "stop tightened for leverage"
        );
        stop_pct = tightened;
        target_pct *= scale;
    }

    StopTarget {
        stop_pct,
        target_pct,
        from_atr,
    }
}

/// Absolute stop price for an entry at `price`.
pub fn stop_price(price: f64, stop_pct: f64, is_long: bool) -> f64 {
    if is_long {
        price * (1.0 - stop_pct)
    } else {
        price * (1.0 + stop_pct)
    }
}

/// Staged target prices: 50 % of size at the first target, 30 % at the
/// extended target. The remaining 20 % rides the trailing stop.
pub fn target_ladder(price: f64, target_pct: f64, is_long: bool) -> Vec<(f64, f64)> {
    let sign = if is_long { 1.0 } else { -1.0 };
    vec![
        (price * (1.0 + sign * target_pct * 0.5), 0.5),
        (price * (1.0 + sign * target_pct), 0.3),
    ]
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::spec_defaults;

    fn candles_with_range(n: usize, base: f64, half_range: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                Candle::new(
                    i as i64 * 60_000,
                    base,
                    base + half_range,
                    base - half_range,
                    base,
                    100.0,
                )
            })
            .collect()
    }

    #[test]
    fn atr_path_respects_clamp() {
        let spec = spec_defaults("BTCUSDT");
        // Huge range -> raw stop would exceed max_stop_distance.
        let candles = candles_with_range(40, 100.0, 10.0);
        let st = compute(&spec, &candles, 100.0, 1.0, 1.0, 10.0);
        assert!(st.from_atr);
        assert!(st.stop_pct <= spec.atr.max_stop_distance + 1e-12);
        assert!(st.stop_pct >= spec.atr.min_stop_distance - 1e-12);
    }

    #[test]
    fn fallback_when_atr_unavailable() {
        let spec = spec_defaults("BTCUSDT");
        let candles = candles_with_range(5, 100.0, 1.0); // too short for ATR
        let st = compute(&spec, &candles, 100.0, 1.0, 1.0, 10.0);
        assert!(!st.from_atr);
        assert_eq!(st.stop_pct, spec.fallback_stop_pct);
        assert_eq!(st.target_pct, spec.fallback_target_pct);
    }

    #[test]
    fn leverage_violation_tightens_stop_and_scales_target() {
        let mut spec = spec_defaults("BTCUSDT");
        spec.leverage = 100;
        let candles = candles_with_range(40, 100.0, 3.0);
        let st = compute(&spec, &candles, 100.0, 1.0, 1.0, DEFAULT_MAX_LOSS_PER_POSITION);

        // stop x leverage <= 0.8 after tightening (0.7 / 100 exactly).
        assert!((st.stop_pct - 0.007).abs() < 1e-12);
        assert!(st.stop_pct * 100.0 <= DEFAULT_MAX_LOSS_PER_POSITION + 1e-9);
        // Target keeps its ratio to the stop.
        let spec_ratio = st.target_pct / st.stop_pct;
        assert!(spec_ratio > 1.0);
    }

    #[test]
    fn stop_price_sides() {
        assert!((stop_price(100.0, 0.01, true) - 99.0).abs() < 1e-12);
        assert!((stop_price(100.0, 0.01, false) - 101.0).abs() < 1e-12);
    }

    #[test]
    fn target_ladder_fractions_leave_a_runner() {
        let ladder = target_ladder(100.0, 0.02, true);
        let total: f64 = ladder.iter().map(|(_, f)| f).sum();
        assert!(total < 1.0);
        assert!(ladder[0].0 < ladder[1].0);

        let short = target_ladder(100.0, 0.02, false);
        assert!(short[0].0 > short[1].0);
    }

    #[test]
    fn regime_multipliers_scale_distances() {
        let spec = spec_defaults("BTCUSDT");
        let candles = candles_with_range(40, 100.0, 0.3);
        let normal = compute(&spec, &candles, 100.0, 1.0, 1.0, 10.0);
        let volatile = compute(&spec, &candles, 100.0, 1.5, 1.1, 10.0);
        assert!(volatile.stop_pct >= normal.stop_pct);
    }
}
