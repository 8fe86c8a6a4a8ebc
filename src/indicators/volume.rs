// =============================================================================
// Volume Indicators — OBV, volume SMA/ratio, MFI, CMF
// =============================================================================
//
// OBV accumulates signed volume by close-to-close direction. MFI is a
// volume-weighted RSI over the typical price. CMF sums the money-flow
// multiplier over a window.
// =============================================================================

use crate::indicators::moving::sma;
use crate::market_data::Candle;

/// On-Balance Volume, aligned with input. Index 0 starts at zero.
pub fn obv(candles: &[Candle]) -> Vec<f64> {
    let mut out = vec![f64::NAN; candles.len()];
    if candles.is_empty() {
        return out;
    }
    out[0] = 0.0;
    let mut acc = 0.0;
    for i in 1..candles.len() {
        let prev_close = candles[i - 1].close;
        let close = candles[i].close;
        if !close.is_finite() || !prev_close.is_finite() {
            out[i] = f64::NAN;
            continue;
        }
        if close > prev_close {
            acc += candles[i].volume;
        } else if close < prev_close {
            acc -= candles[i].volume;
        }
        out[i] = acc;
    }
    out
}

/// Rolling SMA of volume.
pub fn volume_sma(candles: &[Candle], period: usize) -> Vec<f64> {
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    sma(&volumes, period)
}

/// Latest volume relative to its rolling SMA (1.0 = average).
pub fn volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    let avg = crate::indicators::last_finite(&volume_sma(candles, period))?;
    let last = candles.last()?.volume;
    (avg > 0.0).then(|| last / avg)
}

/// Money Flow Index in [0, 100], aligned with input.
pub fn mfi(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    // Signed raw money flow per bar.
    let mut flows = vec![0.0; n];
    let typical = |c: &Candle| (c.high + c.low + c.close) / 3.0;
    for i in 1..n {
        let tp = typical(&candles[i]);
        let prev_tp = typical(&candles[i - 1]);
        if !tp.is_finite() || !prev_tp.is_finite() {
            flows[i] = f64::NAN;
            continue;
        }
        let raw = tp * candles[i].volume;
        flows[i] = if tp > prev_tp {
            raw
        } else if tp < prev_tp {
            -raw
        } else {
            0.0
        };
    }

    for i in period..n {
        let window = &flows[i + 1 - period..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let positive: f64 = window.iter().filter(|v| **v > 0.0).sum();
        let negative: f64 = -window.iter().filter(|v| **v < 0.0).sum::<f64>();
        out[i] = if positive == 0.0 && negative == 0.0 {
            50.0
        } else if negative == 0.0 {
            100.0
        } else {
            let ratio = positive / negative;
            100.0 - 100.0 / (1.0 + ratio)
        };
    }
    out
}

/// Chaikin Money Flow in [-1, 1], aligned with input.
pub fn cmf(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }

    // Money-flow volume per bar.
    let mut mfv = vec![0.0; n];
    for (i, c) in candles.iter().enumerate() {
        let span = c.high - c.low;
        if span > 0.0 {
            let multiplier = ((c.close - c.low) - (c.high - c.close)) / span;
            mfv[i] = multiplier * c.volume;
        } else {
            mfv[i] = 0.0;
        }
        if !c.close.is_finite() {
            mfv[i] = f64::NAN;
        }
    }

    for i in period - 1..n {
        let window_mfv = &mfv[i + 1 - period..=i];
        if window_mfv.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let vol: f64 = candles[i + 1 - period..=i].iter().map(|c| c.volume).sum();
        if vol > 0.0 {
            out[i] = window_mfv.iter().sum::<f64>() / vol;
        }
    }
    out
}
