// =============================================================================
// Per-symbol strategies — weighted sub-analysis mix
// =============================================================================
//
// A strategy turns one timeframe's candles + indicators into a
// `TimeframeVerdict`. Five sub-analyses, each in [-1, 1]:
//
//   trend           — EMA stack, Supertrend, ADX direction
//   mean_reversion  — Bollinger position and RSI extremes (fade)
//   momentum        — MACD, RSI slope, stochastic RSI
//   volume          — volume ratio, OBV slope, CMF
//   support_resistance — distance to the nearest recent swing level
//
// The default ("BTC-like") mix weighs trend 0.35 and momentum 0.25; the
// "ETH-like" variant boosts momentum x1.2, weakens mean-reversion x0.8, and
// only commits to a direction beyond |score| > 0.5.
// =============================================================================

use crate::config::SymbolSpec;
use crate::indicators::IndicatorSet;
use crate::market_data::Candle;
use crate::signal::TimeframeVerdict;
use crate::types::Direction;

/// Swing-level lookback for support/resistance.
const SWING_LOOKBACK: usize = 50;

/// Sub-analysis scores before mixing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubScores {
    pub trend: f64,
    pub mean_reversion: f64,
    pub momentum: f64,
    pub volume: f64,
    pub support_resistance: f64,
}

/// Weight mix applied to `SubScores`.
#[derive(Debug, Clone, Copy)]
pub struct StrategyWeights {
    pub trend: f64,
    pub mean_reversion: f64,
    pub momentum: f64,
    pub volume: f64,
    pub support_resistance: f64,
}

impl StrategyWeights {
    fn apply(&self, scores: &SubScores) -> f64 {
        let total =
            self.trend + self.mean_reversion + self.momentum + self.volume + self.support_resistance;
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = self.trend * scores.trend
            + self.mean_reversion * scores.mean_reversion
            + self.momentum * scores.momentum
            + self.volume * scores.volume
            + self.support_resistance * scores.support_resistance;
        (weighted / total).clamp(-1.0, 1.0)
    }
}

/// One timeframe's analysis for one symbol.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combine candles + indicators into a verdict.
    fn analyze(
        &self,
        spec: &SymbolSpec,
        candles: &[Candle],
        indicators: &IndicatorSet,
    ) -> TimeframeVerdict;

    /// Raw sub-scores (exposed for audit and tests).
    fn sub_scores(&self, candles: &[Candle], indicators: &IndicatorSet) -> SubScores {
        SubScores {
            trend: trend_analysis(indicators),
            mean_reversion: mean_reversion_analysis(indicators),
            momentum: momentum_analysis(indicators),
            volume: volume_analysis(indicators),
            support_resistance: support_resistance_analysis(candles, indicators),
        }
    }
}

/// Pick the strategy variant for a symbol.
pub fn strategy_for(symbol: &str) -> Box<dyn Strategy> {
    if symbol.starts_with("ETH") {
        Box::new(EthStrategy)
    } else {
        Box::new(BtcStrategy)
    }
}

// ---------------------------------------------------------------------------
// Sub-analyses
// ---------------------------------------------------------------------------

fn trend_analysis(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    // EMA stack: 20 over 50 over 200.
    if let (Some(e20), Some(e50)) = (ind.ema_20, ind.ema_50) {
        let fast = ((e20 - e50) / e50 / 0.01).clamp(-1.0, 1.0);
        score += 0.4 * fast;
        weight += 0.4;
        if let Some(s200) = ind.sma_200 {
            let slow = ((e50 - s200) / s200 / 0.02).clamp(-1.0, 1.0);
            score += 0.2 * slow;
            weight += 0.2;
        }
    }
    if let Some(st) = ind.supertrend_direction {
        score += 0.25 * st;
        weight += 0.25;
    }
    if let Some(ts) = ind.trend_strength {
        score += 0.15 * ts;
        weight += 0.15;
    }

    if weight > 0.0 {
        (score / weight).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn mean_reversion_analysis(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    // Price pressed into a band edge argues for the fade.
    if let Some(pos) = ind.price_position {
        score += 0.6 * -pos;
        weight += 0.6;
    }
    if let Some(rsi) = ind.rsi_14 {
        let stretch = if rsi >= 70.0 {
            -((rsi - 70.0) / 30.0)
        } else if rsi <= 30.0 {
            (30.0 - rsi) / 30.0
        } else {
            0.0
        };
        score += 0.4 * stretch.clamp(-1.0, 1.0);
        weight += 0.4;
    }

    if weight > 0.0 {
        (score / weight).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn momentum_analysis(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    if let Some(hist) = ind.macd_histogram {
        let normalised = (hist / ind.last_close.abs().max(1e-9) * 1000.0).clamp(-1.0, 1.0);
        score += 0.4 * normalised;
        weight += 0.4;
    }
    if let Some(rsi6) = ind.rsi_6 {
        score += 0.3 * ((rsi6 - 50.0) / 50.0);
        weight += 0.3;
    }
    if let Some(stoch) = ind.stoch_rsi {
        score += 0.3 * (stoch * 2.0 - 1.0);
        weight += 0.3;
    }

    if weight > 0.0 {
        (score / weight).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn volume_analysis(ind: &IndicatorSet) -> f64 {
    let mut score = 0.0;
    let mut weight = 0.0;

    if let Some(obv) = ind.obv_slope {
        score += 0.4 * (obv * 50.0).clamp(-1.0, 1.0);
        weight += 0.4;
    }
    if let Some(cmf) = ind.cmf {
        score += 0.35 * cmf.clamp(-1.0, 1.0);
        weight += 0.35;
    }
    if let Some(ratio) = ind.volume_ratio {
        // A spike amplifies whatever the flow says; sign comes from CMF/OBV.
        let spike = ((ratio - 1.0) / 2.0).clamp(0.0, 1.0);
        let flow_sign = ind.cmf.map(|c| c.signum()).unwrap_or(0.0);
        score += 0.25 * spike * flow_sign;
        weight += 0.25;
    }

    if weight > 0.0 {
        (score / weight).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn support_resistance_analysis(candles: &[Candle], ind: &IndicatorSet) -> f64 {
    if candles.len() < SWING_LOOKBACK {
        return 0.0;
    }
    let close = ind.last_close;
    if !close.is_finite() || close <= 0.0 {
        return 0.0;
    }
    let window = &candles[candles.len() - SWING_LOOKBACK..];
    let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let span = resistance - support;
    if span <= 0.0 {
        return 0.0;
    }
    // Near support argues long, near resistance argues short.
    let position = (close - support) / span; // 0 at support, 1 at resistance
    ((0.5 - position) * 2.0).clamp(-1.0, 1.0)
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Confidence [0, 100] from sub-analysis agreement and score magnitude.
fn confidence_from(scores: &SubScores, mixed: f64) -> f64 {
    let components = [
        scores.trend,
        scores.mean_reversion,
        scores.momentum,
        scores.volume,
        scores.support_resistance,
    ];
    let agreeing = components
        .iter()
        .filter(|c| c.signum() == mixed.signum() && c.abs() > 0.1)
        .count() as f64;
    let agreement = agreeing / components.len() as f64;
    (30.0 + 40.0 * agreement + 30.0 * mixed.abs()).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Default mix: trend-led.
pub struct BtcStrategy;

impl BtcStrategy {
    const WEIGHTS: StrategyWeights = StrategyWeights {
        trend: 0.35,
        mean_reversion: 0.15,
        momentum: 0.25,
        volume: 0.125,
        support_resistance: 0.125,
    };
}

impl Strategy for BtcStrategy {
    fn name(&self) -> &'static str {
        "btc_like"
    }

    fn analyze(
        &self,
        _spec: &SymbolSpec,
        candles: &[Candle],
        indicators: &IndicatorSet,
    ) -> TimeframeVerdict {
        let scores = self.sub_scores(candles, indicators);
        let mixed = Self::WEIGHTS.apply(&scores);
        TimeframeVerdict {
            direction: Direction::from_score(mixed),
            score: mixed,
            confidence: confidence_from(&scores, mixed),
        }
    }
}

/// Momentum-tilted mix with a higher decision bar.
pub struct EthStrategy;

impl EthStrategy {
    const WEIGHTS: StrategyWeights = StrategyWeights {
        trend: 0.35,
        mean_reversion: 0.15 * 0.8,
        momentum: 0.25 * 1.2,
        volume: 0.125,
        support_resistance: 0.125,
    };
    /// |score| must clear this before the verdict commits to a direction.
    const DECISION_THRESHOLD: f64 = 0.5;
}

impl Strategy for EthStrategy {
    fn name(&self) -> &'static str {
        "eth_like"
    }

    fn analyze(
        &self,
        _spec: &SymbolSpec,
        candles: &[Candle],
        indicators: &IndicatorSet,
    ) -> TimeframeVerdict {
        let scores = self.sub_scores(candles, indicators);
        let mixed = Self::WEIGHTS.apply(&scores);
        let direction = if mixed.abs() > Self::DECISION_THRESHOLD {
            Direction::from_score(mixed)
        } else {
            Direction::Neutral
        };
        TimeframeVerdict {
            direction,
            score: mixed,
            confidence: confidence_from(&scores, mixed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolSpec as ConfigSymbolSpec;

    fn window(n: usize, f: impl Fn(usize) -> f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = f(i);
                Candle::new(i as i64 * 60_000, base, base + 1.0, base - 1.0, base, 100.0)
            })
            .collect()
    }

    fn spec(symbol: &str) -> ConfigSymbolSpec {
        crate::config::test_support::spec_defaults(symbol)
    }

    #[test]
    fn uptrend_reads_long_for_btc() {
        let candles = window(300, |i| 100.0 + i as f64 * 1.2);
        let indicators = IndicatorSet::compute(&candles);
        let verdict = BtcStrategy.analyze(&spec("BTCUSDT"), &candles, &indicators);
        assert_eq!(verdict.direction, Direction::Long);
        assert!(verdict.score > 0.1, "score {}", verdict.score);
        assert!(verdict.confidence > 40.0);
    }

    #[test]
    fn downtrend_reads_short_for_btc() {
        let candles = window(300, |i| 600.0 - i as f64 * 1.2);
        let indicators = IndicatorSet::compute(&candles);
        let verdict = BtcStrategy.analyze(&spec("BTCUSDT"), &candles, &indicators);
        assert_eq!(verdict.direction, Direction::Short);
        assert!(verdict.score < -0.1, "score {}", verdict.score);
    }

    #[test]
    fn eth_variant_requires_conviction() {
        // A mild drift clears the BTC bar but not the ETH decision threshold.
        let candles = window(300, |i| 100.0 + (i as f64 * 0.05).sin() * 2.0 + i as f64 * 0.01);
        let indicators = IndicatorSet::compute(&candles);
        let eth = EthStrategy.analyze(&spec("ETHUSDT"), &candles, &indicators);
        if eth.score.abs() <= EthStrategy::DECISION_THRESHOLD {
            assert_eq!(eth.direction, Direction::Neutral);
        }
    }

    #[test]
    fn eth_weights_tilt_momentum() {
        assert!(EthStrategy::WEIGHTS.momentum > BtcStrategy::WEIGHTS.momentum);
        assert!(EthStrategy::WEIGHTS.mean_reversion < BtcStrategy::WEIGHTS.mean_reversion);
    }

    #[test]
    fn scores_bounded() {
        let candles = window(300, |i| 100.0 + (i as f64 * 0.4).sin() * 12.0);
        let indicators = IndicatorSet::compute(&candles);
        for strategy in [strategy_for("BTCUSDT"), strategy_for("ETHUSDT")] {
            let verdict = strategy.analyze(&spec("BTCUSDT"), &candles, &indicators);
            assert!((-1.0..=1.0).contains(&verdict.score));
            assert!((0.0..=100.0).contains(&verdict.confidence));
        }
    }

    #[test]
    fn strategy_selection_by_symbol() {
        assert_eq!(strategy_for("ETHUSDT").name(), "eth_like");
        assert_eq!(strategy_for("BTCUSDT").name(), "btc_like");
        assert_eq!(strategy_for("SOLUSDT").name(), "btc_like");
    }

    #[test]
    fn support_resistance_fades_the_extremes() {
        // Close pinned at the top of the range reads short.
        let mut candles = window(100, |_| 100.0);
        for c in candles.iter_mut().skip(95) {
            c.close = 120.0;
            c.high = 121.0;
        }
        let indicators = IndicatorSet::compute(&candles);
        let sr = support_resistance_analysis(&candles, &indicators);
        assert!(sr < 0.0, "close at range top should read short, got {sr}");
    }
}
