// =============================================================================
// Relative Strength Index (RSI) + Stochastic RSI — Wilder's smoothing
// =============================================================================
//
// RSI:
//   Seed average gain/loss with the SMA of the first `period` deltas, then
//     avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//     avg_loss = (prev_avg_loss * (period - 1) + loss) / period
//     RSI      = 100 - 100 / (1 + avg_gain / avg_loss)
//
// Stochastic RSI normalises RSI into its own rolling min/max band:
//   stoch_rsi = (RSI - min(RSI, n)) / (max(RSI, n) - min(RSI, n))
// =============================================================================

/// RSI series aligned with `closes`; the first `period` slots are NaN.
///
/// Edge behavior: flat markets give 50, all-gain gives 100, all-loss gives 0.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for (i, &delta) in deltas.iter().enumerate().skip(period) {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out[i + 1] = rsi_from_averages(avg_gain, avg_loss);
    }

    out
}

/// Stochastic RSI in [0, 1], from an RSI series and a rolling window.
pub fn stoch_rsi(rsi_series: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; rsi_series.len()];
    if window == 0 {
        return out;
    }

    for i in 0..rsi_series.len() {
        if i + 1 < window {
            continue;
        }
        let slice = &rsi_series[i + 1 - window..=i];
        if slice.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let min = slice.iter().copied().fold(f64::INFINITY, f64::min);
        let max = slice.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = max - min;
        out[i] = if span > 0.0 {
            (rsi_series[i] - min) / span
        } else {
            0.5
        };
    }
    out
}

/// Average gain/loss -> RSI value in [0, 100]. Flat input maps to 50, a
/// loss-free window to 100; non-finite inputs propagate as NaN.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return f64::NAN;
    }
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::last_finite;

    #[test]
    fn rsi_alignment() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = rsi(&closes, 14);
        assert_eq!(series.len(), 30);
        for v in &series[..14] {
            assert!(v.is_nan());
        }
        assert!(series[14].is_finite());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = rsi(&closes, 14);
        assert!((last_finite(&series).unwrap() - 100.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let series = rsi(&closes, 14);
        assert!(last_finite(&series).unwrap().abs() < 1e-10);
    }

    #[test]
    fn rsi_flat_is_50() {
        let closes = vec![100.0; 30];
        let series = rsi(&closes, 14);
        assert!((last_finite(&series).unwrap() - 50.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 44.90,
        ];
        for v in rsi(&closes, 14).iter().filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_insufficient_data_all_nan() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi(&closes, 14).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn stoch_rsi_bounds() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.4).sin() * 8.0)
            .collect();
        let r = rsi(&closes, 14);
        let s = stoch_rsi(&r, 14);
        assert_eq!(s.len(), r.len());
        for v in s.iter().filter(|v| v.is_finite()) {
            assert!((0.0..=1.0).contains(v), "stoch rsi {v} out of range");
        }
    }

    #[test]
    fn stoch_rsi_flat_window_is_midpoint() {
        let r = vec![50.0; 30];
        let s = stoch_rsi(&r, 14);
        assert!((last_finite(&s).unwrap() - 0.5).abs() < 1e-12);
    }
}
