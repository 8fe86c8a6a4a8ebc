// =============================================================================
// Average Directional Index (ADX) with +DI / -DI
// =============================================================================
//
// Wilder's construction:
//   +DM = high_t - high_{t-1}  when it exceeds the down-move and is positive
//   -DM = low_{t-1} - low_t    when it exceeds the up-move and is positive
//   +DI = 100 * smoothed(+DM) / ATR
//   -DI = 100 * smoothed(-DM) / ATR
//   DX  = 100 * |+DI - -DI| / (+DI + -DI)
//   ADX = Wilder-smoothed DX
//
// ADX reads: < 20 no trend, 20-25 building, > 25 trending, > 40 strong.
// =============================================================================

use crate::market_data::Candle;

#[derive(Debug, Clone)]
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// ADX/DI series aligned with `candles`. The ADX column needs roughly
/// `2 * period` bars of warm-up; earlier slots are NaN.
pub fn adx(candles: &[Candle], period: usize) -> AdxSeries {
    let n = candles.len();
    let mut out = AdxSeries {
        adx: vec![f64::NAN; n],
        plus_di: vec![f64::NAN; n],
        minus_di: vec![f64::NAN; n],
    };
    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    // Per-bar directional movement and true range.
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    let mut tr = vec![0.0; n];
    for i in 1..n {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };

        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;
        tr[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }

    // Wilder running sums, seeded over the first `period` bars.
    let period_f = period as f64;
    let mut sm_plus: f64 = plus_dm[1..=period].iter().sum();
    let mut sm_minus: f64 = minus_dm[1..=period].iter().sum();
    let mut sm_tr: f64 = tr[1..=period].iter().sum();

    let mut dx = vec![f64::NAN; n];
    for i in period..n {
        if i > period {
            sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
            sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
            sm_tr = sm_tr - sm_tr / period_f + tr[i];
        }
        if sm_tr <= 0.0 || !sm_tr.is_finite() {
            continue;
        }
        let pdi = 100.0 * sm_plus / sm_tr;
        let mdi = 100.0 * sm_minus / sm_tr;
        out.plus_di[i] = pdi;
        out.minus_di[i] = mdi;
        let di_sum = pdi + mdi;
        if di_sum > 0.0 {
            dx[i] = 100.0 * (pdi - mdi).abs() / di_sum;
        }
    }

    // ADX: seed with the mean of the first `period` DX values, then smooth.
    let seed_start = period;
    let seed_end = 2 * period;
    let seed_slice = &dx[seed_start..seed_end];
    if seed_slice.iter().any(|v| !v.is_finite()) {
        return out;
    }
    let mut adx_val = seed_slice.iter().sum::<f64>() / period_f;
    out.adx[seed_end - 1] = adx_val;
    for i in seed_end..n {
        if !dx[i].is_finite() {
            continue;
        }
        adx_val = (adx_val * (period_f - 1.0) + dx[i]) / period_f;
        out.adx[i] = adx_val;
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::last_finite;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, close, high, low, close, 100.0)
    }

    fn strong_uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base + 1.0, base - 1.0, base + 0.8)
            })
            .collect()
    }

    #[test]
    fn insufficient_data_all_nan() {
        let candles = strong_uptrend(20);
        let out = adx(&candles, 14);
        assert!(out.adx.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn uptrend_has_high_adx_and_plus_di_dominant() {
        let candles = strong_uptrend(80);
        let out = adx(&candles, 14);
        let adx_last = last_finite(&out.adx).unwrap();
        let pdi = last_finite(&out.plus_di).unwrap();
        let mdi = last_finite(&out.minus_di).unwrap();
        assert!(adx_last > 25.0, "trending market should give ADX > 25, got {adx_last}");
        assert!(pdi > mdi, "uptrend should have +DI > -DI ({pdi} vs {mdi})");
    }

    #[test]
    fn downtrend_has_minus_di_dominant() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                candle(base + 1.0, base - 1.0, base - 0.8)
            })
            .collect();
        let out = adx(&candles, 14);
        let pdi = last_finite(&out.plus_di).unwrap();
        let mdi = last_finite(&out.minus_di).unwrap();
        assert!(mdi > pdi);
    }

    #[test]
    fn choppy_market_has_low_adx() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let base = 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 };
                candle(base + 1.5, base - 1.5, base)
            })
            .collect();
        let out = adx(&candles, 14);
        let adx_last = last_finite(&out.adx).unwrap();
        assert!(adx_last < 25.0, "choppy market should give low ADX, got {adx_last}");
    }

    #[test]
    fn adx_within_bounds() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(base + 2.0, base - 2.0, base)
            })
            .collect();
        let out = adx(&candles, 14);
        for v in out.adx.iter().filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v), "ADX {v} out of range");
        }
    }
}
