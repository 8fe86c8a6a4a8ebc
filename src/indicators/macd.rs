// =============================================================================
// MACD — Moving Average Convergence / Divergence (12 / 26 / 9)
// =============================================================================
//
//   macd      = EMA_fast(close) - EMA_slow(close)
//   signal    = EMA_signal(macd)
//   histogram = macd - signal
// =============================================================================

use crate::indicators::moving::ema;

/// MACD output series, all aligned with the input closes.
#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Compute MACD with the given periods. Warm-up slots are NaN.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let n = closes.len();
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);

    let mut macd_line = vec![f64::NAN; n];
    for i in 0..n {
        if ema_fast[i].is_finite() && ema_slow[i].is_finite() {
            macd_line[i] = ema_fast[i] - ema_slow[i];
        }
    }

    // The signal EMA runs over the finite suffix of the macd line, then is
    // stitched back at the original offsets to keep alignment.
    let first_finite = macd_line.iter().position(|v| v.is_finite());
    let mut signal_line = vec![f64::NAN; n];
    if let Some(start) = first_finite {
        let finite_tail: Vec<f64> = macd_line[start..].to_vec();
        let sig = ema(&finite_tail, signal_period);
        for (offset, value) in sig.into_iter().enumerate() {
            signal_line[start + offset] = value;
        }
    }

    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        if macd_line[i].is_finite() && signal_line[i].is_finite() {
            histogram[i] = macd_line[i] - signal_line[i];
        }
    }

    MacdSeries {
        macd: macd_line,
        signal: signal_line,
        histogram,
    }
}

/// Standard 12/26/9 configuration.
pub fn macd_standard(closes: &[f64]) -> MacdSeries {
    macd(closes, 12, 26, 9)
}
