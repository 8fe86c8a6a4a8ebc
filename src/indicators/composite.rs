// =============================================================================
// IndicatorSet — one pass over a candle window, everything the signal
// engine needs
// =============================================================================
//
// Computed per (symbol, timeframe) per cycle; derived, never persisted.
// Latest values are `Option<f64>` (None while warming up); the handful of
// full series the pattern detector needs are kept alongside.
//
// Derived aggregates:
//   price_position   — close inside the Bollinger band, [-1, 1]
//   trend_strength   — signed ADX/DI/Supertrend composite, [-1, 1]
//   volatility_ratio — ATR relative to its own 50-bar average, ~1.0 normal
// =============================================================================

use crate::indicators::adx::adx;
use crate::indicators::atr::{atr, atr_latest, atr_pct, supertrend};
use crate::indicators::bands::{band_position, bollinger, keltner, BandSeries};
use crate::indicators::ichimoku::cloud_position;
use crate::indicators::macd::{macd_standard, MacdSeries};
use crate::indicators::moving::{ema, sma, vwap};
use crate::indicators::rsi::{rsi, stoch_rsi};
use crate::indicators::volume::{cmf, mfi, obv, volume_ratio};
use crate::indicators::{finite_at_back, last_finite, recent_slope};
use crate::market_data::Candle;

/// Latest-value snapshot plus the series needed by the pattern detector.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    // --- Moving averages -----------------------------------------------------
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
    pub ema_200: Option<f64>,
    pub vwap: Option<f64>,

    // --- Momentum ------------------------------------------------------------
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub macd_histogram_slope: Option<f64>,
    pub rsi_6: Option<f64>,
    pub rsi_14: Option<f64>,
    pub rsi_24: Option<f64>,
    pub stoch_rsi: Option<f64>,
    pub mfi: Option<f64>,

    // --- Volatility ----------------------------------------------------------
    pub bollinger_upper: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub bollinger_width: Option<f64>,
    pub keltner_width: Option<f64>,
    pub atr: Option<f64>,
    pub atr_pct: Option<f64>,

    // --- Trend ---------------------------------------------------------------
    pub adx: Option<f64>,
    pub plus_di: Option<f64>,
    pub minus_di: Option<f64>,
    pub supertrend_direction: Option<f64>,
    pub cloud_position: Option<f64>,

    // --- Volume --------------------------------------------------------------
    pub obv_slope: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub cmf: Option<f64>,

    // --- Aggregates ----------------------------------------------------------
    pub price_position: Option<f64>,
    pub trend_strength: Option<f64>,
    pub volatility_ratio: Option<f64>,

    // --- Series kept for the pattern detector --------------------------------
    pub rsi_14_series: Vec<f64>,
    pub macd_series: MacdSeries,
    pub bollinger_series: BandSeries,
    pub last_close: f64,
}

impl IndicatorSet {
    /// Compute the full set over a candle window (oldest first).
    ///
    /// Deterministic: the same window yields bitwise-identical output.
    pub fn compute(candles: &[Candle]) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last_close = closes.last().copied().unwrap_or(f64::NAN);

        let sma_20_series = sma(&closes, 20);
        let sma_50_series = sma(&closes, 50);
        let sma_200_series = sma(&closes, 200);
        let ema_20_series = ema(&closes, 20);
        let ema_50_series = ema(&closes, 50);
        let ema_200_series = ema(&closes, 200);
        let vwap_series = vwap(candles);

        let macd_series = macd_standard(&closes);
        let rsi_6_series = rsi(&closes, 6);
        let rsi_14_series = rsi(&closes, 14);
        let rsi_24_series = rsi(&closes, 24);
        let stoch_series = stoch_rsi(&rsi_14_series, 14);
        let mfi_series = mfi(candles, 14);

        let bollinger_series = bollinger(&closes, 20, 2.0);
        let keltner_series = keltner(candles, 20, 10, 2.0);
        let atr_series = atr(candles, 14);
        let adx_series = adx(candles, 14);
        let st = supertrend(candles, 10, 3.0);

        let obv_series = obv(candles);
        let cmf_series = cmf(candles, 20);

        // price_position: close normalised into the Bollinger band.
        let price_position = match (
            last_finite(&bollinger_series.upper),
            last_finite(&bollinger_series.lower),
        ) {
            (Some(upper), Some(lower)) => {
                band_position(last_close, upper, lower).map(|p| p.clamp(-1.0, 1.0))
            }
            _ => None,
        };

        // trend_strength: ADX magnitude signed by DI spread and Supertrend.
        let trend_strength = trend_strength_from(
            last_finite(&adx_series.adx),
            last_finite(&adx_series.plus_di),
            last_finite(&adx_series.minus_di),
            last_finite(&st.direction),
        );

        // volatility_ratio: latest ATR over its own 50-bar mean.
        let volatility_ratio = {
            let atr_sma = sma(&atr_series, 50);
            match (last_finite(&atr_series), last_finite(&atr_sma)) {
                (Some(a), Some(mean)) if mean > 0.0 => Some(a / mean),
                _ => None,
            }
        };

        Self {
            sma_20: last_finite(&sma_20_series),
            sma_50: last_finite(&sma_50_series),
            sma_200: last_finite(&sma_200_series),
            ema_20: last_finite(&ema_20_series),
            ema_50: last_finite(&ema_50_series),
            ema_200: last_finite(&ema_200_series),
            vwap: last_finite(&vwap_series),

            macd: last_finite(&macd_series.macd),
            macd_signal: last_finite(&macd_series.signal),
            macd_histogram: last_finite(&macd_series.histogram),
            macd_histogram_slope: recent_slope(&macd_series.histogram, 5),
            rsi_6: last_finite(&rsi_6_series),
            rsi_14: last_finite(&rsi_14_series),
            rsi_24: last_finite(&rsi_24_series),
            stoch_rsi: last_finite(&stoch_series),
            mfi: last_finite(&mfi_series),

            bollinger_upper: last_finite(&bollinger_series.upper),
            bollinger_middle: last_finite(&bollinger_series.middle),
            bollinger_lower: last_finite(&bollinger_series.lower),
            bollinger_width: last_finite(&bollinger_series.width),
            keltner_width: last_finite(&keltner_series.width),
            atr: atr_latest(candles, 14),
            atr_pct: atr_pct(candles, 14),

            adx: last_finite(&adx_series.adx),
            plus_di: last_finite(&adx_series.plus_di),
            minus_di: last_finite(&adx_series.minus_di),
            supertrend_direction: last_finite(&st.direction),
            cloud_position: cloud_position(candles),

            obv_slope: recent_slope(&obv_series, 10),
            volume_ratio: volume_ratio(candles, 20),
            cmf: last_finite(&cmf_series),

            price_position,
            trend_strength,
            volatility_ratio,

            rsi_14_series,
            macd_series,
            bollinger_series,
            last_close,
        }
    }

    /// Bollinger width `n` bars back (for squeeze detection).
    pub fn bollinger_width_at_back(&self, offset: usize) -> Option<f64> {
        finite_at_back(&self.bollinger_series.width, offset)
    }
}

/// Signed trend composite in [-1, 1].
fn trend_strength_from(
    adx: Option<f64>,
    plus_di: Option<f64>,
    minus_di: Option<f64>,
    supertrend_dir: Option<f64>,
) -> Option<f64> {
    let adx = adx?;
    let pdi = plus_di?;
    let mdi = minus_di?;

    let magnitude = (adx / 50.0).clamp(0.0, 1.0);
    let di_span = pdi + mdi;
    let di_bias = if di_span > 0.0 {
        (pdi - mdi) / di_span
    } else {
        0.0
    };
    // Supertrend agreement nudges the bias; disagreement dampens it.
    let st_bias = supertrend_dir.unwrap_or(0.0);
    let direction = (di_bias + 0.3 * st_bias).clamp(-1.0, 1.0);

    Some((magnitude * direction).clamp(-1.0, 1.0))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn window(n: usize, f: impl Fn(usize) -> f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = f(i);
                Candle::new(
                    i as i64 * 60_000,
                    base,
                    base + 1.5,
                    base - 1.5,
                    base + 0.5,
                    100.0 + (i % 7) as f64,
                )
            })
            .collect()
    }

    #[test]
    fn full_window_populates_everything() {
        let candles = window(300, |i| 100.0 + (i as f64 * 0.15).sin() * 6.0);
        let set = IndicatorSet::compute(&candles);

        assert!(set.sma_200.is_some());
        assert!(set.ema_200.is_some());
        assert!(set.macd.is_some());
        assert!(set.rsi_6.is_some());
        assert!(set.rsi_14.is_some());
        assert!(set.rsi_24.is_some());
        assert!(set.stoch_rsi.is_some());
        assert!(set.mfi.is_some());
        assert!(set.bollinger_width.is_some());
        assert!(set.keltner_width.is_some());
        assert!(set.atr.is_some());
        assert!(set.adx.is_some());
        assert!(set.supertrend_direction.is_some());
        assert!(set.cloud_position.is_some());
        assert!(set.obv_slope.is_some());
        assert!(set.volume_ratio.is_some());
        assert!(set.cmf.is_some());
        assert!(set.price_position.is_some());
        assert!(set.trend_strength.is_some());
        assert!(set.volatility_ratio.is_some());
    }

    #[test]
    fn short_window_leaves_slow_indicators_empty() {
        let candles = window(60, |i| 100.0 + i as f64 * 0.1);
        let set = IndicatorSet::compute(&candles);
        assert!(set.sma_200.is_none());
        assert!(set.ema_200.is_none());
        // Fast indicators still work.
        assert!(set.rsi_14.is_some());
        assert!(set.sma_20.is_some());
    }

    #[test]
    fn deterministic_recompute() {
        let candles = window(250, |i| 100.0 + (i as f64 * 0.2).cos() * 4.0);
        let a = IndicatorSet::compute(&candles);
        let b = IndicatorSet::compute(&candles);
        assert_eq!(a.rsi_14, b.rsi_14);
        assert_eq!(a.macd, b.macd);
        assert_eq!(a.atr, b.atr);
        assert_eq!(a.trend_strength, b.trend_strength);
        assert_eq!(a.rsi_14_series, b.rsi_14_series);
    }

    #[test]
    fn uptrend_has_positive_trend_strength() {
        let candles = window(300, |i| 100.0 + i as f64 * 1.0);
        let set = IndicatorSet::compute(&candles);
        assert!(set.trend_strength.unwrap() > 0.3);
    }

    #[test]
    fn downtrend_has_negative_trend_strength() {
        let candles = window(300, |i| 500.0 - i as f64 * 1.0);
        let set = IndicatorSet::compute(&candles);
        assert!(set.trend_strength.unwrap() < -0.3);
    }

    #[test]
    fn aggregates_respect_bounds() {
        let candles = window(300, |i| 100.0 + (i as f64 * 0.3).sin() * 10.0);
        let set = IndicatorSet::compute(&candles);
        let pp = set.price_position.unwrap();
        let ts = set.trend_strength.unwrap();
        assert!((-1.0..=1.0).contains(&pp));
        assert!((-1.0..=1.0).contains(&ts));
        assert!(set.volatility_ratio.unwrap() > 0.0);
    }
}
