// =============================================================================
// Ichimoku Cloud — conversion / base lines and the leading spans
// =============================================================================
//
// Standard parameters (9 / 26 / 52):
//   tenkan   = midpoint of the 9-bar high/low range   (conversion line)
//   kijun    = midpoint of the 26-bar high/low range  (base line)
//   senkou_a = (tenkan + kijun) / 2, plotted 26 ahead
//   senkou_b = midpoint of the 52-bar range, plotted 26 ahead
//
// Here the spans are reported at the bar they are COMPUTED from (no forward
// displacement): the signal engine compares the latest close against the
// cloud values that apply to it now.
// =============================================================================

use crate::market_data::Candle;

#[derive(Debug, Clone)]
pub struct IchimokuSeries {
    pub tenkan: Vec<f64>,
    pub kijun: Vec<f64>,
    pub senkou_a: Vec<f64>,
    pub senkou_b: Vec<f64>,
}

fn midpoint(candles: &[Candle]) -> f64 {
    let mut high = f64::NEG_INFINITY;
    let mut low = f64::INFINITY;
    for c in candles {
        if !c.high.is_finite() || !c.low.is_finite() {
            return f64::NAN;
        }
        high = high.max(c.high);
        low = low.min(c.low);
    }
    (high + low) / 2.0
}

fn rolling_midpoint(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    for i in period - 1..n {
        out[i] = midpoint(&candles[i + 1 - period..=i]);
    }
    out
}

/// Ichimoku with standard 9/26/52 parameters.
pub fn ichimoku(candles: &[Candle]) -> IchimokuSeries {
    ichimoku_with(candles, 9, 26, 52)
}

pub fn ichimoku_with(
    candles: &[Candle],
    tenkan_period: usize,
    kijun_period: usize,
    senkou_b_period: usize,
) -> IchimokuSeries {
    let n = candles.len();
    let tenkan = rolling_midpoint(candles, tenkan_period);
    let kijun = rolling_midpoint(candles, kijun_period);
    let senkou_b = rolling_midpoint(candles, senkou_b_period);

    let mut senkou_a = vec![f64::NAN; n];
    for i in 0..n {
        if tenkan[i].is_finite() && kijun[i].is_finite() {
            senkou_a[i] = (tenkan[i] + kijun[i]) / 2.0;
        }
    }

    IchimokuSeries {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
    }
}

/// Where the latest close sits relative to the cloud: +1 above, -1 below,
/// 0 inside. `None` when the cloud is not yet computable.
pub fn cloud_position(candles: &[Candle]) -> Option<f64> {
    let series = ichimoku(candles);
    let close = candles.last()?.close;
    let a = crate::indicators::last_finite(&series.senkou_a)?;
    let b = crate::indicators::last_finite(&series.senkou_b)?;
    let top = a.max(b);
    let bottom = a.min(b);
    Some(if close > top {
        1.0
    } else if close < bottom {
        -1.0
    } else {
        0.0
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::last_finite;

    fn candles_rising(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64;
                Candle::new(i as i64 * 60_000, base, base + 2.0, base - 2.0, base + 1.0, 10.0)
            })
            .collect()
    }

    #[test]
    fn warmup_lengths() {
        let candles = candles_rising(60);
        let series = ichimoku(&candles);
        assert!(series.tenkan[7].is_nan());
        assert!(series.tenkan[8].is_finite());
        assert!(series.kijun[24].is_nan());
        assert!(series.kijun[25].is_finite());
        assert!(series.senkou_b[50].is_nan());
        assert!(series.senkou_b[51].is_finite());
    }

    #[test]
    fn tenkan_is_range_midpoint() {
        let candles = candles_rising(20);
        let series = ichimoku(&candles);
        // Last 9 bars: highs 112..=121 + 2, lows 111..=119 - 2 etc.
        let window = &candles[11..20];
        let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        assert!((series.tenkan[19] - (high + low) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn uptrend_close_is_above_cloud() {
        let candles = candles_rising(120);
        assert_eq!(cloud_position(&candles), Some(1.0));
    }

    #[test]
    fn downtrend_close_is_below_cloud() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let base = 300.0 - i as f64;
                Candle::new(i as i64 * 60_000, base, base + 2.0, base - 2.0, base - 1.0, 10.0)
            })
            .collect();
        assert_eq!(cloud_position(&candles), Some(-1.0));
    }

    #[test]
    fn short_series_has_no_cloud() {
        let candles = candles_rising(30);
        assert_eq!(cloud_position(&candles), None);
        let series = ichimoku(&candles);
        assert!(last_finite(&series.senkou_b).is_none());
    }
}
