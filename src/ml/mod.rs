// =============================================================================
// ML Module — feature extraction + ensemble port
// =============================================================================
//
// The ensemble is a port to the rest of the engine: `predict` always returns
// a valid `(score, confidence)` tuple — from the trained heads when
// available, from a deterministic technical heuristic otherwise. Training
// and persistence never block or break the trading path.
// =============================================================================

pub mod ensemble;
pub mod heads;

pub use ensemble::MlEnsemble;
pub use heads::{Dataset, HeadPerformance, ModelHead};

use serde::Serialize;

use crate::indicators::IndicatorSet;
use crate::signal::regime::RegimeSnapshot;

/// Ordered feature names; `build_features` emits values in this order.
pub const FEATURE_NAMES: &[&str] = &[
    "rsi_14",
    "rsi_6",
    "macd_histogram",
    "stoch_rsi",
    "mfi",
    "bollinger_position",
    "atr_pct",
    "adx",
    "di_spread",
    "trend_strength",
    "price_position",
    "volatility_ratio",
    "volume_ratio",
    "obv_slope",
    "cmf",
    "cloud_position",
    "supertrend_direction",
    "regime_score",
];

/// Ensemble output consumed by signal fusion.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    /// [-1, 1]
    pub score: f64,
    /// [0, 1]
    pub confidence: f64,
    /// Per-head contributions (name, score, confidence).
    pub per_model: Vec<(String, f64, f64)>,
    /// `true` when produced by the technical heuristic instead of the heads.
    pub is_fallback: bool,
}

/// Build the normalised feature vector for one symbol's analysis.
///
/// Missing indicator values become 0.0 (the neutral point of each feature's
/// normalisation), so a warming-up window still yields a usable vector.
pub fn build_features(indicators: &IndicatorSet, regime: &RegimeSnapshot) -> Vec<f64> {
    let centered = |v: Option<f64>, mid: f64, span: f64| {
        v.map(|x| ((x - mid) / span).clamp(-1.0, 1.0)).unwrap_or(0.0)
    };
    let raw = |v: Option<f64>| v.unwrap_or(0.0).clamp(-1.0, 1.0);

    let di_spread = match (indicators.plus_di, indicators.minus_di) {
        (Some(p), Some(m)) if p + m > 0.0 => (p - m) / (p + m),
        _ => 0.0,
    };

    vec![
        centered(indicators.rsi_14, 50.0, 50.0),
        centered(indicators.rsi_6, 50.0, 50.0),
        indicators
            .macd_histogram
            .map(|h| (h / indicators.last_close.abs().max(1e-9) * 1000.0).clamp(-1.0, 1.0))
            .unwrap_or(0.0),
        centered(indicators.stoch_rsi, 0.5, 0.5),
        centered(indicators.mfi, 50.0, 50.0),
        raw(indicators.price_position),
        indicators
            .atr_pct
            .map(|a| (a * 20.0).clamp(0.0, 1.0))
            .unwrap_or(0.0),
        indicators
            .adx
            .map(|a| (a / 50.0).clamp(0.0, 1.0))
            .unwrap_or(0.0),
        di_spread,
        raw(indicators.trend_strength),
        raw(indicators.price_position),
        indicators
            .volatility_ratio
            .map(|v| ((v - 1.0)).clamp(-1.0, 1.0))
            .unwrap_or(0.0),
        indicators
            .volume_ratio
            .map(|v| ((v - 1.0) / 2.0).clamp(-1.0, 1.0))
            .unwrap_or(0.0),
        raw(indicators.obv_slope.map(|s| s * 50.0)),
        raw(indicators.cmf),
        raw(indicators.cloud_position),
        raw(indicators.supertrend_direction),
        regime.score().clamp(-1.0, 1.0),
    ]
}

/// Build a training dataset from candle history: features at bar `i` paired
/// with the (scaled) forward return `horizon` bars later.
///
/// Returns are scaled so a 2 % move saturates the [-1, 1] target domain.
/// `stride` thins the windows to keep retraining cheap.
pub fn build_training_dataset(
    candles: &[crate::market_data::Candle],
    horizon: usize,
    stride: usize,
) -> heads::Dataset {
    use crate::signal::regime::classify;

    const RETURN_SCALE: f64 = 0.02;
    /// Minimum history before the first sample.
    const WARMUP: usize = 200;

    let mut dataset = heads::Dataset::default();
    if candles.len() < WARMUP + horizon + 1 || horizon == 0 {
        return dataset;
    }

    let stride = stride.max(1);
    let mut i = WARMUP;
    while i + horizon < candles.len() {
        let window = &candles[..=i];
        let indicators = IndicatorSet::compute(window);
        let regime = classify(&indicators);
        let features = build_features(&indicators, &regime);

        let now = candles[i].close;
        let later = candles[i + horizon].close;
        if now > 0.0 && now.is_finite() && later.is_finite() {
            let forward_return = (later - now) / now;
            dataset.push(features, (forward_return / RETURN_SCALE).clamp(-1.0, 1.0));
        }
        i += stride;
    }
    dataset
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::signal::regime::classify;

    fn window(n: usize, f: impl Fn(usize) -> f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = f(i);
                Candle::new(i as i64 * 60_000, base, base + 1.0, base - 1.0, base, 100.0)
            })
            .collect()
    }

    #[test]
    fn features_match_name_table() {
        let candles = window(300, |i| 100.0 + (i as f64 * 0.2).sin() * 5.0);
        let indicators = IndicatorSet::compute(&candles);
        let regime = classify(&indicators);
        let features = build_features(&indicators, &regime);
        assert_eq!(features.len(), FEATURE_NAMES.len());
    }

    #[test]
    fn features_are_bounded() {
        let candles = window(300, |i| 100.0 + i as f64 * 3.0);
        let indicators = IndicatorSet::compute(&candles);
        let regime = classify(&indicators);
        for (name, value) in FEATURE_NAMES
            .iter()
            .zip(build_features(&indicators, &regime))
        {
            assert!(
                (-1.0..=1.0).contains(&value),
                "feature {name} = {value} out of [-1, 1]"
            );
            assert!(value.is_finite());
        }
    }

    #[test]
    fn training_dataset_pairs_features_with_forward_returns() {
        let candles = window(320, |i| 100.0 + i as f64 * 0.5);
        let dataset = build_training_dataset(&candles, 12, 10);
        assert!(!dataset.is_empty());
        assert_eq!(dataset.features.len(), dataset.targets.len());
        // Monotone uptrend: every forward return is positive.
        assert!(dataset.targets.iter().all(|t| *t > 0.0));
        assert!(dataset.targets.iter().all(|t| (-1.0..=1.0).contains(t)));
    }

    #[test]
    fn training_dataset_requires_history() {
        let candles = window(100, |i| 100.0 + i as f64);
        assert!(build_training_dataset(&candles, 12, 5).is_empty());
    }

    #[test]
    fn short_window_yields_neutral_features() {
        let candles = window(30, |i| 100.0 + i as f64);
        let indicators = IndicatorSet::compute(&candles);
        let regime = classify(&indicators);
        let features = build_features(&indicators, &regime);
        // Slow indicators are missing; their features default to 0.
        assert!(features.iter().all(|v| v.is_finite()));
    }
}
