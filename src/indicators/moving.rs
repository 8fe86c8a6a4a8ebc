// =============================================================================
// Moving Averages — SMA, EMA, VWAP
// =============================================================================
//
// EMA formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = value_t * multiplier + EMA_{t-1} * (1 - multiplier)
// seeded with the SMA of the first `period` values.
//
// All outputs are aligned with the input; warm-up slots are NaN.
// =============================================================================

use crate::market_data::Candle;

/// Simple moving average, NaN-padded for the first `period - 1` slots.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    out[period - 1] = window_sum / period as f64;
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        out[i] = window_sum / period as f64;
    }
    out
}

/// Exponential moving average, SMA-seeded, NaN-padded warm-up.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    let mut prev = seed;
    for i in period..values.len() {
        let next = values[i] * multiplier + prev * (1.0 - multiplier);
        out[i] = next;
        prev = next;
    }
    out
}

/// Volume-weighted average price over the whole window, computed cumulatively
/// per bar using the typical price (H+L+C)/3.
pub fn vwap(candles: &[Candle]) -> Vec<f64> {
    let mut out = vec![f64::NAN; candles.len()];
    let mut cum_pv = 0.0;
    let mut cum_vol = 0.0;
    for (i, c) in candles.iter().enumerate() {
        let typical = (c.high + c.low + c.close) / 3.0;
        cum_pv += typical * c.volume;
        cum_vol += c.volume;
        if cum_vol > 0.0 {
            out[i] = cum_pv / cum_vol;
        }
    }
    out
}
