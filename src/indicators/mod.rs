// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the signal
// engine. Every series function returns a vector ALIGNED with its input: the
// warm-up prefix is NaN-padded rather than truncated, so indicator columns
// can be zipped against the owning candle sequence by index. NaNs propagate;
// nothing here panics on short or degenerate input.

pub mod adx;
pub mod atr;
pub mod bands;
pub mod composite;
pub mod ichimoku;
pub mod macd;
pub mod moving;
pub mod rsi;
pub mod volume;

pub use composite::IndicatorSet;

/// Most recent finite value of a series, if any.
pub fn last_finite(series: &[f64]) -> Option<f64> {
    series.iter().rev().copied().find(|v| v.is_finite())
}

/// Finite value at `offset` bars back from the end (0 = last).
pub fn finite_at_back(series: &[f64], offset: usize) -> Option<f64> {
    let idx = series.len().checked_sub(1 + offset)?;
    let v = series[idx];
    v.is_finite().then_some(v)
}

/// Simple least-squares slope over the last `window` finite values,
/// normalised by the mean magnitude. `None` when fewer than two finite
/// values are available.
pub fn recent_slope(series: &[f64], window: usize) -> Option<f64> {
    let tail: Vec<f64> = series
        .iter()
        .rev()
        .take(window)
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if tail.len() < 2 {
        return None;
    }
    let values: Vec<f64> = tail.into_iter().rev().collect();
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return None;
    }
    let slope = num / den;
    let scale = mean_y.abs().max(1e-12);
    Some(slope / scale)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_finite_skips_nans() {
        let series = vec![1.0, 2.0, f64::NAN];
        assert_eq!(last_finite(&series), Some(2.0));
        assert_eq!(last_finite(&[f64::NAN, f64::NAN]), None);
        assert_eq!(last_finite(&[]), None);
    }

    #[test]
    fn finite_at_back_indexes_from_end() {
        let series = vec![1.0, 2.0, 3.0];
        assert_eq!(finite_at_back(&series, 0), Some(3.0));
        assert_eq!(finite_at_back(&series, 2), Some(1.0));
        assert_eq!(finite_at_back(&series, 3), None);
    }

    #[test]
    fn slope_sign_matches_trend() {
        let rising: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        assert!(recent_slope(&rising, 10).unwrap() > 0.0);

        let falling: Vec<f64> = (1..=20).rev().map(|i| i as f64).collect();
        assert!(recent_slope(&falling, 10).unwrap() < 0.0);

        let flat = vec![5.0; 20];
        assert_eq!(recent_slope(&flat, 10), Some(0.0));
    }
}
