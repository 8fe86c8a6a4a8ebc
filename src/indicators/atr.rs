// =============================================================================
// Average True Range + Supertrend
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is Wilder-smoothed TR:
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Supertrend places a band at midpoint +/- mult * ATR and flips direction
// when the close crosses the active band.
// =============================================================================

use crate::market_data::Candle;

/// True-range series aligned with `candles` (index 0 is NaN — no previous
/// close).
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let mut out = vec![f64::NAN; candles.len()];
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;
        out[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }
    out
}

/// Wilder-smoothed ATR series aligned with `candles`.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; candles.len()];
    if period == 0 || candles.len() < period + 1 {
        return out;
    }

    let tr = true_range(candles);
    let seed: f64 = tr[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = seed;

    let period_f = period as f64;
    let mut prev = seed;
    for i in period + 1..candles.len() {
        let next = (prev * (period_f - 1.0) + tr[i]) / period_f;
        out[i] = next;
        prev = next;
    }
    out
}

/// Most recent ATR value.
pub fn atr_latest(candles: &[Candle], period: usize) -> Option<f64> {
    crate::indicators::last_finite(&atr(candles, period)).filter(|v| *v > 0.0)
}

/// ATR as a fraction of the latest close (0.01 = 1 %).
pub fn atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = atr_latest(candles, period)?;
    let close = candles.last()?.close;
    (close > 0.0).then(|| atr / close)
}

/// Supertrend output: the band series and the flip direction
/// (+1 bullish, -1 bearish) per bar.
#[derive(Debug, Clone)]
pub struct SupertrendSeries {
    pub line: Vec<f64>,
    pub direction: Vec<f64>,
}

/// Supertrend with the given ATR period and band multiplier.
pub fn supertrend(candles: &[Candle], period: usize, multiplier: f64) -> SupertrendSeries {
    let n = candles.len();
    let mut line = vec![f64::NAN; n];
    let mut direction = vec![f64::NAN; n];
    let atr_series = atr(candles, period);

    let mut prev_upper = f64::NAN;
    let mut prev_lower = f64::NAN;
    let mut prev_dir = 1.0;

    for i in 0..n {
        let a = atr_series[i];
        if !a.is_finite() {
            continue;
        }
        let mid = (candles[i].high + candles[i].low) / 2.0;
        let mut upper = mid + multiplier * a;
        let mut lower = mid - multiplier * a;
        let close = candles[i].close;
        let prev_close = if i > 0 { candles[i - 1].close } else { close };

        // Bands ratchet: they only tighten while price respects them.
        if prev_upper.is_finite() && (upper > prev_upper && prev_close <= prev_upper) {
            upper = prev_upper;
        }
        if prev_lower.is_finite() && (lower < prev_lower && prev_close >= prev_lower) {
            lower = prev_lower;
        }

        let dir = if !prev_upper.is_finite() {
            1.0
        } else if close > prev_upper {
            1.0
        } else if close < prev_lower {
            -1.0
        } else {
            prev_dir
        };

        direction[i] = dir;
        line[i] = if dir > 0.0 { lower } else { upper };

        prev_upper = upper;
        prev_lower = lower;
        prev_dir = dir;
    }

    SupertrendSeries { line, direction }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::last_finite;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_alignment_and_warmup() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                candle(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let series = atr(&candles, 14);
        assert_eq!(series.len(), 30);
        for v in &series[..14] {
            assert!(v.is_nan());
        }
        assert!(series[14].is_finite());
    }

    #[test]
    fn constant_range_converges_to_range() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                candle(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let latest = atr_latest(&candles, 14).unwrap();
        assert!((latest - 10.0).abs() < 1.0, "expected ~10, got {latest}");
    }

    #[test]
    fn gap_inflates_true_range() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0), // |115 - 95| = 20 dominates
        ];
        let tr = true_range(&candles);
        assert!((tr[1] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn atr_pct_fractional() {
        let candles: Vec<Candle> = (0..30)
            .map(|_| candle(100.0, 101.0, 99.0, 100.0))
            .collect();
        let pct = atr_pct(&candles, 14).unwrap();
        assert!((pct - 0.02).abs() < 0.005, "expected ~2 %, got {pct}");
    }

    #[test]
    fn atr_insufficient_data_is_none() {
        let candles: Vec<Candle> = (0..10).map(|_| candle(1.0, 2.0, 0.5, 1.5)).collect();
        assert!(atr_latest(&candles, 14).is_none());
    }

    #[test]
    fn atr_nan_input_propagates() {
        let mut candles: Vec<Candle> = (0..20).map(|_| candle(1.0, 2.0, 0.5, 1.5)).collect();
        candles[19].high = f64::NAN;
        let series = atr(&candles, 14);
        assert!(series[19].is_nan());
    }

    #[test]
    fn supertrend_uptrend_is_bullish() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        let st = supertrend(&candles, 10, 3.0);
        assert_eq!(last_finite(&st.direction), Some(1.0));
        // Bullish line sits below price.
        let line = last_finite(&st.line).unwrap();
        assert!(line < candles.last().unwrap().close);
    }

    #[test]
    fn supertrend_downtrend_is_bearish() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                candle(base, base + 1.0, base - 1.0, base - 0.5)
            })
            .collect();
        let st = supertrend(&candles, 10, 3.0);
        assert_eq!(last_finite(&st.direction), Some(-1.0));
    }
}
