// =============================================================================
// Fusion — combine MTF, regime, patterns, ML, and news into one Signal
// =============================================================================
//
// Technical sub-score = 0.50 x MTF + 0.30 x regime lean + 0.20 x patterns.
//
// Weights: technical carries `technical_weight` (default 0.60); the
// remainder splits ml_weight / news_weight (defaults 0.80 / 0.20 of the
// remainder). With the ML ensemble unavailable the split collapses to
// {technical 0.80, news 0.20}.
//
// Confidence is the weighted mix of component confidences, plus an agreement
// bonus when ML, news, and MTF all share the final score's sign, minus a
// volatility penalty. Entry requires a STRICT threshold cross, the
// confidence floor, and MTF alignment; symbols flagged extreme-RSI-only also
// require RSI outside [25, 75].
// =============================================================================

use tracing::debug;

use crate::config::{Config, SymbolSpec};
use crate::indicators::IndicatorSet;
use crate::market_data::Candle;
use crate::ml::{build_features, MlEnsemble, Prediction};
use crate::news::NewsAssessment;
use crate::signal::mtf::{self, MtfResult};
use crate::signal::patterns::{self, PatternResult};
use crate::signal::regime::{classify, RegimeSnapshot};
use crate::signal::strategy::strategy_for;
use crate::signal::{ComponentScores, Signal};
use crate::types::Direction;

/// Agreement bonus added when MTF, ML, and news all share the final sign.
const AGREEMENT_BONUS: f64 = 8.0;
/// Confidence penalty per unit of volatility score.
const VOLATILITY_PENALTY: f64 = 12.0;
/// RSI band excluded for extreme-RSI-only symbols.
const EXTREME_RSI_BAND: (f64, f64) = (25.0, 75.0);

/// Per-timeframe candle windows handed to the engine for one symbol.
pub struct SymbolWindows {
    /// (timeframe, candles) in the symbol's configured order.
    pub windows: Vec<(String, std::sync::Arc<Vec<Candle>>)>,
}

pub struct SignalEngine {
    technical_weight: f64,
    ml_weight: f64,
    news_weight: f64,
    max_loss_per_position: f64,
}

impl SignalEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            technical_weight: config.technical_weight,
            ml_weight: config.ml_weight,
            news_weight: config.news_weight,
            max_loss_per_position: config.max_loss_per_position,
        }
    }

    /// Produce the fused signal for one symbol.
    ///
    /// CPU-only: candle windows and the news assessment are gathered by the
    /// engine loop beforehand.
    pub fn evaluate(
        &self,
        spec: &SymbolSpec,
        windows: &SymbolWindows,
        ml: &MlEnsemble,
        news: &NewsAssessment,
    ) -> Signal {
        // --- Per-timeframe strategy verdicts + primary indicator set --------
        let strategy = strategy_for(&spec.symbol);
        let mut verdicts = Vec::new();
        // The heaviest timeframe drives regime, patterns, and features.
        let mut primary: Option<(f64, IndicatorSet, &std::sync::Arc<Vec<Candle>>)> = None;

        for (timeframe, candles) in &windows.windows {
            let weight = spec
                .timeframe_weights
                .iter()
                .find(|(tf, _)| tf == timeframe)
                .map(|(_, w)| *w)
                .unwrap_or(0.0);
            if weight <= 0.0 || candles.is_empty() {
                continue;
            }
            let indicators = IndicatorSet::compute(candles);
            let verdict = strategy.analyze(spec, candles, &indicators);
            verdicts.push((timeframe.clone(), weight, verdict));
            if primary.as_ref().map_or(true, |(w, _, _)| weight > *w) {
                primary = Some((weight, indicators, candles));
            }
        }

        let Some((_, indicators, primary_candles)) = primary else {
            return Signal::neutral(&spec.symbol, crate::signal::MarketRegime::Ranging);
        };

        // --- Components -----------------------------------------------------
        let mtf_result = mtf::combine(&verdicts, spec.timeframe_agreement);
        let regime = classify(&indicators);
        let pattern_result = patterns::detect(primary_candles, &indicators, mtf_result.direction);

        let features = build_features(&indicators, &regime);
        let prediction = ml.predict(&features, &indicators);
        let ml_available = ml.is_available();

        // News sentiment scaled by impact.
        let news_score = (news.sentiment * news.impact.multiplier()).clamp(-1.0, 1.0);

        // --- Fusion ----------------------------------------------------------
        let fused = self.fuse(
            spec,
            &mtf_result,
            &regime,
            &pattern_result,
            &prediction,
            ml_available,
            news_score,
            news.confidence,
            &indicators,
        );

        debug!(
            symbol = %spec.symbol,
            score = fused.score,
            confidence = fused.confidence,
            regime = %fused.regime,
            aligned = mtf_result.aligned,
            should_trade = fused.should_trade,
            "signal evaluated"
        );
        fused
    }

    #[allow(clippy::too_many_arguments)]
    fn fuse(
        &self,
        spec: &SymbolSpec,
        mtf_result: &MtfResult,
        regime: &RegimeSnapshot,
        pattern_result: &PatternResult,
        prediction: &Prediction,
        ml_available: bool,
        news_score: f64,
        news_confidence: f64,
        indicators: &IndicatorSet,
    ) -> Signal {
        // Technical sub-score.
        let technical =
            0.50 * mtf_result.score + 0.30 * regime.score() + 0.20 * pattern_result.score;

        // Component weights.
        let (w_technical, w_ml, w_news) = if ml_available {
            let remainder = 1.0 - self.technical_weight;
            (
                self.technical_weight,
                self.ml_weight * remainder,
                self.news_weight * remainder,
            )
        } else {
            (0.80, 0.0, 0.20)
        };

        let ml_score = if ml_available { prediction.score } else { 0.0 };
        let final_score =
            (technical * w_technical + ml_score * w_ml + news_score * w_news).clamp(-1.0, 1.0);

        // Confidence: weighted component mix.
        let ml_confidence_pct = prediction.confidence * 100.0;
        let news_confidence_pct = news_confidence * 100.0;
        let weight_sum = w_technical + w_ml + w_news;
        let mut confidence = (w_technical * mtf_result.confidence
            + w_ml * ml_confidence_pct
            + w_news * news_confidence_pct)
            / weight_sum.max(1e-9);

        // Agreement bonus: MTF, ML, and news all leaning the same way.
        let signs = [mtf_result.score, ml_score, news_score];
        let final_sign = final_score.signum();
        if final_sign != 0.0
            && signs
                .iter()
                .all(|s| s.signum() == final_sign && s.abs() > 0.05)
        {
            confidence += AGREEMENT_BONUS;
        }

        // Volatility penalty.
        confidence -= regime.volatility_score * VOLATILITY_PENALTY;
        let confidence = confidence.clamp(0.0, 100.0);

        // --- Entry decision --------------------------------------------------
        let threshold = spec.signal_threshold * regime.params.signal_threshold_multiplier;
        let mut should_trade = final_score.abs() > threshold // strict at the boundary
            && confidence >= spec.confidence_required
            && mtf_result.aligned;

        if should_trade && spec.extreme_rsi_only {
            let rsi_ok = indicators
                .rsi_14
                .map(|rsi| rsi < EXTREME_RSI_BAND.0 || rsi > EXTREME_RSI_BAND.1)
                .unwrap_or(false);
            should_trade = rsi_ok;
        }

        let direction = if should_trade {
            Direction::from_score(final_score)
        } else {
            Direction::Neutral
        };

        // Advisory stop/target distances carried on the signal, from the ATR
        // already computed in the primary indicator set.
        let (stop_pct, target_pct) = match indicators.atr {
            Some(atr) if indicators.last_close > 0.0 => {
                let stop = (atr * spec.atr.stop_multiplier * regime.params.stop_multiplier
                    / indicators.last_close)
                    .clamp(spec.atr.min_stop_distance, spec.atr.max_stop_distance);
                let target = atr * spec.atr.target_multiplier * regime.params.target_multiplier
                    / indicators.last_close;
                let leverage = spec.leverage.max(1) as f64;
                if stop * leverage > self.max_loss_per_position {
                    let tightened = 0.7 / leverage;
                    (tightened, target * tightened / stop)
                } else {
                    (stop, target)
                }
            }
            _ => (spec.fallback_stop_pct, spec.fallback_target_pct),
        };

        Signal {
            symbol: spec.symbol.clone(),
            direction,
            score: final_score,
            confidence,
            component_scores: ComponentScores {
                mtf: mtf_result.score,
                regime: regime.score(),
                patterns: pattern_result.score,
                ml: ml_score,
                news: news_score,
            },
            regime: regime.regime,
            alignment_score: mtf_result.alignment_score,
            expected_move: pattern_result.expected_move,
            stop_pct,
            target_pct,
            position_size_multiplier: regime.params.position_size_multiplier,
            should_trade,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::spec_defaults;
    use crate::news::NewsAssessment;
    use std::sync::Arc;

    fn windows_from(f: impl Fn(usize) -> f64) -> SymbolWindows {
        let mk = |step: usize| {
            Arc::new(
                (0..300)
                    .map(|i| {
                        let base = f(i * step);
                        Candle::new(
                            (i * step) as i64 * 60_000,
                            base,
                            base + 1.0,
                            base - 1.0,
                            base,
                            100.0,
                        )
                    })
                    .collect::<Vec<_>>(),
            )
        };
        SymbolWindows {
            windows: vec![
                ("15m".to_string(), mk(1)),
                ("1h".to_string(), mk(4)),
                ("4h".to_string(), mk(16)),
            ],
        }
    }

    fn engine() -> SignalEngine {
        SignalEngine {
            technical_weight: 0.60,
            ml_weight: 0.80,
            news_weight: 0.20,
            max_loss_per_position: 0.8,
        }
    }

    fn untrained_ml() -> MlEnsemble {
        MlEnsemble::new(std::env::temp_dir().join("borealis-fusion-none"), 24)
    }

    #[test]
    fn invariants_hold_for_any_window() {
        let spec = spec_defaults("BTCUSDT");
        let ml = untrained_ml();
        for f in [
            |i: usize| 100.0 + i as f64 * 0.8,
            |i: usize| 5_000.0 - i as f64 * 0.8,
            |i: usize| 100.0 + (i as f64 * 0.7).sin() * 3.0,
        ] {
            let signal = engine().evaluate(&spec, &windows_from(f), &ml, &NewsAssessment::neutral());
            assert!(signal.score.abs() <= 1.0, "score {}", signal.score);
            assert!((0.0..=100.0).contains(&signal.confidence));
            assert!((0.0..=1.0).contains(&signal.alignment_score));
        }
    }

    #[test]
    fn strong_uptrend_trades_long() {
        let spec = spec_defaults("BTCUSDT");
        let ml = untrained_ml();
        let signal = engine().evaluate(
            &spec,
            &windows_from(|i| 100.0 + i as f64 * 0.8),
            &ml,
            &NewsAssessment::neutral(),
        );
        assert!(signal.score > 0.15, "score {}", signal.score);
        if signal.should_trade {
            assert_eq!(signal.direction, Direction::Long);
        }
        assert!(signal.stop_pct > 0.0);
        assert!(signal.target_pct > signal.stop_pct);
    }

    #[test]
    fn ml_unavailable_collapses_weights() {
        // With ML untrained the news weight is 0.2 of the whole: a strongly
        // negative news read should drag an otherwise flat signal negative.
        let spec = spec_defaults("BTCUSDT");
        let ml = untrained_ml();
        let mut bad_news = NewsAssessment::neutral();
        bad_news.sentiment = -1.0;
        bad_news.impact = crate::news::Impact::High;
        bad_news.confidence = 0.9;

        let flat = engine().evaluate(
            &spec,
            &windows_from(|i| 100.0 + (i as f64 * 0.9).sin() * 0.3),
            &ml,
            &bad_news,
        );
        assert!(flat.component_scores.ml == 0.0);
        assert!(flat.component_scores.news < -0.9);
        assert!(flat.score < 0.0);
    }

    #[test]
    fn threshold_is_strict_at_boundary() {
        // Directly exercise the entry comparison used in fuse().
        let threshold = 0.25_f64;
        let score_at = 0.25_f64;
        assert!(!(score_at.abs() > threshold));
        let score_above = 0.2500001_f64;
        assert!(score_above.abs() > threshold);
    }

    #[test]
    fn extreme_rsi_gate_blocks_midband() {
        let mut spec = spec_defaults("BTCUSDT");
        spec.extreme_rsi_only = true;
        // Lower the bars so the gate is the only thing standing.
        spec.signal_threshold = 0.01;
        spec.confidence_required = 0.0;
        spec.timeframe_agreement = 0.0;

        let ml = untrained_ml();
        // A steady but gentle climb keeps RSI high; a sine keeps it mid-band.
        let mid = engine().evaluate(
            &spec,
            &windows_from(|i| 100.0 + (i as f64 * 0.5).sin() * 2.0),
            &ml,
            &NewsAssessment::neutral(),
        );
        assert!(!mid.should_trade, "mid-band RSI must not trade");

        let trending = engine().evaluate(
            &spec,
            &windows_from(|i| 100.0 + i as f64 * 0.8),
            &ml,
            &NewsAssessment::neutral(),
        );
        // RSI pinned near 100 in a monotone climb passes the gate.
        if trending.score.abs() > spec.signal_threshold {
            assert!(trending.should_trade);
        }
    }

    #[test]
    fn neutral_when_no_usable_windows() {
        let spec = spec_defaults("BTCUSDT");
        let ml = untrained_ml();
        let empty = SymbolWindows { windows: vec![] };
        let signal = engine().evaluate(&spec, &empty, &ml, &NewsAssessment::neutral());
        assert!(!signal.should_trade);
        assert_eq!(signal.direction, Direction::Neutral);
    }
}
