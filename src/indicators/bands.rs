// =============================================================================
// Volatility Bands — Bollinger Bands and Keltner Channels
// =============================================================================
//
// Bollinger: middle = SMA(close, 20), bands at +/- 2 standard deviations.
// Keltner:   middle = EMA(close, 20), bands at +/- 2 * ATR(10).
//
// `width` is the normalised band spread (upper - lower) / middle — the
// volatility input of the regime classifier and the squeeze detector.
// =============================================================================

use crate::indicators::atr::atr;
use crate::indicators::moving::{ema, sma};
use crate::market_data::Candle;

#[derive(Debug, Clone)]
pub struct BandSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
    pub width: Vec<f64>,
}

/// Bollinger bands over closes with the given period and deviation multiple.
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> BandSeries {
    let n = closes.len();
    let middle = sma(closes, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];

    if period == 0 || n < period {
        return BandSeries {
            upper,
            middle,
            lower,
            width,
        };
    }

    for i in period - 1..n {
        if !middle[i].is_finite() {
            continue;
        }
        let window = &closes[i + 1 - period..=i];
        let mean = middle[i];
        let variance =
            window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
        let std = variance.sqrt();
        if !std.is_finite() {
            continue;
        }
        upper[i] = mean + num_std * std;
        lower[i] = mean - num_std * std;
        if mean != 0.0 {
            width[i] = (upper[i] - lower[i]) / mean;
        }
    }

    BandSeries {
        upper,
        middle,
        lower,
        width,
    }
}

/// Keltner channels: EMA midline with ATR-scaled envelopes.
pub fn keltner(candles: &[Candle], period: usize, atr_period: usize, mult: f64) -> BandSeries {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let middle = ema(&closes, period);
    let atr_series = atr(candles, atr_period);

    let n = candles.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];

    for i in 0..n {
        if middle[i].is_finite() && atr_series[i].is_finite() {
            upper[i] = middle[i] + mult * atr_series[i];
            lower[i] = middle[i] - mult * atr_series[i];
            if middle[i] != 0.0 {
                width[i] = (upper[i] - lower[i]) / middle[i];
            }
        }
    }

    BandSeries {
        upper,
        middle,
        lower,
        width,
    }
}

/// Position of the latest close inside a band, normalised to [-1, 1]
/// (-1 at the lower band, +1 at the upper). Values outside the band saturate
/// beyond those bounds.
pub fn band_position(close: f64, upper: f64, lower: f64) -> Option<f64> {
    if !close.is_finite() || !upper.is_finite() || !lower.is_finite() {
        return None;
    }
    let span = upper - lower;
    if span <= 0.0 {
        return None;
    }
    Some(((close - lower) / span) * 2.0 - 1.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::last_finite;

    #[test]
    fn bollinger_flat_market_has_zero_width() {
        let closes = vec![100.0; 40];
        let bands = bollinger(&closes, 20, 2.0);
        let width = last_finite(&bands.width).unwrap();
        assert!(width.abs() < 1e-12);
        assert_eq!(last_finite(&bands.middle), Some(100.0));
    }

    #[test]
    fn bollinger_bands_straddle_middle() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 5.0)
            .collect();
        let bands = bollinger(&closes, 20, 2.0);
        for i in 0..closes.len() {
            if bands.upper[i].is_finite() {
                assert!(bands.upper[i] >= bands.middle[i]);
                assert!(bands.lower[i] <= bands.middle[i]);
            }
        }
    }

    #[test]
    fn bollinger_short_input_all_nan() {
        let bands = bollinger(&[1.0, 2.0, 3.0], 20, 2.0);
        assert!(bands.upper.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn wider_swings_widen_bollinger() {
        let calm: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin() * 0.5).collect();
        let wild: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin() * 8.0).collect();
        let calm_w = last_finite(&bollinger(&calm, 20, 2.0).width).unwrap();
        let wild_w = last_finite(&bollinger(&wild, 20, 2.0).width).unwrap();
        assert!(wild_w > calm_w);
    }

    #[test]
    fn keltner_straddles_ema() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 4.0;
                Candle::new(i as i64 * 60_000, base, base + 2.0, base - 2.0, base, 50.0)
            })
            .collect();
        let bands = keltner(&candles, 20, 10, 2.0);
        let upper = last_finite(&bands.upper).unwrap();
        let middle = last_finite(&bands.middle).unwrap();
        let lower = last_finite(&bands.lower).unwrap();
        assert!(upper > middle && middle > lower);
    }

    #[test]
    fn band_position_normalisation() {
        assert_eq!(band_position(100.0, 110.0, 90.0), Some(0.0));
        assert_eq!(band_position(110.0, 110.0, 90.0), Some(1.0));
        assert_eq!(band_position(90.0, 110.0, 90.0), Some(-1.0));
        // Outside the band saturates past the bounds.
        assert!(band_position(120.0, 110.0, 90.0).unwrap() > 1.0);
        // Degenerate band.
        assert_eq!(band_position(100.0, 100.0, 100.0), None);
        assert_eq!(band_position(f64::NAN, 110.0, 90.0), None);
    }
}
