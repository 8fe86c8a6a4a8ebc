// =============================================================================
// Pattern Detector — candlestick, chart, and indicator patterns
// =============================================================================
//
// A best-effort booster on top of the MTF analysis. Detected patterns each
// contribute `expected_move x confidence`; contributions aligned with the
// prevailing MTF direction count fully, conflicting ones at half weight.
//
// Candlestick: hammer / hanging man, doji, bullish / bearish engulfing,
//              three white soldiers / three black crows.
// Chart:       nearest support / resistance touch, ascending / descending /
//              symmetrical triangles, double top / bottom.
// Indicator:   RSI divergence, MACD signal cross, Bollinger squeeze.
// =============================================================================

use serde::Serialize;

use crate::indicators::{finite_at_back, IndicatorSet};
use crate::market_data::Candle;
use crate::types::Direction;

/// Window scanned for chart structures.
const CHART_LOOKBACK: usize = 60;
/// Tolerance when matching swing levels (fraction of price).
const LEVEL_TOLERANCE: f64 = 0.004;
/// Conflicting-pattern weight.
const CONFLICT_WEIGHT: f64 = 0.5;

/// One detected pattern.
#[derive(Debug, Clone, Serialize)]
pub struct PatternHit {
    pub name: &'static str,
    pub direction: Direction,
    /// Expected move magnitude as a fraction of price.
    pub expected_move: f64,
    /// [0, 1]
    pub confidence: f64,
}

/// Aggregated pattern view.
#[derive(Debug, Clone, Serialize)]
pub struct PatternResult {
    /// Signed booster score in [-1, 1] (sign aligned to MTF direction).
    pub score: f64,
    /// Magnitude of the strongest expected move (fraction).
    pub expected_move: f64,
    pub hits: Vec<PatternHit>,
}

impl PatternResult {
    pub fn none() -> Self {
        Self {
            score: 0.0,
            expected_move: 0.0,
            hits: Vec::new(),
        }
    }
}

/// Detect all patterns and fold them into one booster score.
pub fn detect(
    candles: &[Candle],
    indicators: &IndicatorSet,
    mtf_direction: Direction,
) -> PatternResult {
    let mut hits = Vec::new();
    hits.extend(candlestick_patterns(candles));
    hits.extend(chart_patterns(candles));
    hits.extend(indicator_patterns(indicators));

    if hits.is_empty() {
        return PatternResult::none();
    }

    let mut score = 0.0;
    let mut expected_move: f64 = 0.0;
    for hit in &hits {
        let contribution = hit.expected_move * hit.confidence * hit.direction.sign();
        // Conflicting patterns count at half weight.
        let weight = if mtf_direction == Direction::Neutral
            || hit.direction == Direction::Neutral
            || hit.direction == mtf_direction
        {
            1.0
        } else {
            CONFLICT_WEIGHT
        };
        score += contribution * weight;
        expected_move = expected_move.max(hit.expected_move);
    }

    PatternResult {
        // Expected moves are small fractions; scale into the score domain.
        score: (score * 20.0).clamp(-1.0, 1.0),
        expected_move,
        hits,
    }
}

// ---------------------------------------------------------------------------
// Candlestick patterns
// ---------------------------------------------------------------------------

fn body(c: &Candle) -> f64 {
    (c.close - c.open).abs()
}

fn range(c: &Candle) -> f64 {
    c.high - c.low
}

fn is_bullish(c: &Candle) -> bool {
    c.close > c.open
}

fn candlestick_patterns(candles: &[Candle]) -> Vec<PatternHit> {
    let mut hits = Vec::new();
    let n = candles.len();
    if n < 3 {
        return hits;
    }
    let last = &candles[n - 1];
    let prev = &candles[n - 2];

    let last_range = range(last);
    if last_range <= 0.0 || !last_range.is_finite() {
        return hits;
    }
    let last_body = body(last);

    // Hammer / hanging man: small body at the top, long lower shadow.
    let lower_shadow = last.open.min(last.close) - last.low;
    let upper_shadow = last.high - last.open.max(last.close);
    if last_body > 0.0 && lower_shadow > 2.0 * last_body && upper_shadow < last_body {
        // Context decides the reading: after a decline it is a hammer (long),
        // after an advance a hanging man (short).
        let declining = candles[n - 3].close > prev.close;
        hits.push(PatternHit {
            name: if declining { "hammer" } else { "hanging_man" },
            direction: if declining {
                Direction::Long
            } else {
                Direction::Short
            },
            expected_move: 0.01,
            confidence: 0.5,
        });
    }

    // Doji: body under 10 % of the range.
    if last_body < 0.1 * last_range {
        hits.push(PatternHit {
            name: "doji",
            direction: Direction::Neutral,
            expected_move: 0.004,
            confidence: 0.3,
        });
    }

    // Engulfing: current body swallows the previous, opposite colours.
    if body(prev) > 0.0
        && last_body > body(prev)
        && is_bullish(last) != is_bullish(prev)
        && last.open.max(last.close) >= prev.open.max(prev.close)
        && last.open.min(last.close) <= prev.open.min(prev.close)
    {
        hits.push(PatternHit {
            name: if is_bullish(last) {
                "bullish_engulfing"
            } else {
                "bearish_engulfing"
            },
            direction: if is_bullish(last) {
                Direction::Long
            } else {
                Direction::Short
            },
            expected_move: 0.012,
            confidence: 0.6,
        });
    }

    // Three soldiers / crows: three consecutive strong same-colour bodies.
    let trio = &candles[n - 3..];
    let all_bullish = trio.iter().all(|c| is_bullish(c) && body(c) > 0.5 * range(c));
    let all_bearish = trio.iter().all(|c| !is_bullish(c) && body(c) > 0.5 * range(c));
    let ascending = trio.windows(2).all(|w| w[1].close > w[0].close);
    let descending = trio.windows(2).all(|w| w[1].close < w[0].close);
    if all_bullish && ascending {
        hits.push(PatternHit {
            name: "three_white_soldiers",
            direction: Direction::Long,
            expected_move: 0.015,
            confidence: 0.65,
        });
    } else if all_bearish && descending {
        hits.push(PatternHit {
            name: "three_black_crows",
            direction: Direction::Short,
            expected_move: 0.015,
            confidence: 0.65,
        });
    }

    hits
}

// ---------------------------------------------------------------------------
// Chart patterns
// ---------------------------------------------------------------------------

/// Local swing highs/lows over the lookback (simple 2-neighbour pivots).
fn swings(candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();
    for i in 2..candles.len().saturating_sub(2) {
        let window = &candles[i - 2..=i + 2];
        let center = &candles[i];
        if window.iter().all(|c| c.high <= center.high) {
            highs.push(center.high);
        }
        if window.iter().all(|c| c.low >= center.low) {
            lows.push(center.low);
        }
    }
    (highs, lows)
}

fn near(a: f64, b: f64, price: f64) -> bool {
    (a - b).abs() <= price * LEVEL_TOLERANCE
}

fn chart_patterns(candles: &[Candle]) -> Vec<PatternHit> {
    let mut hits = Vec::new();
    if candles.len() < CHART_LOOKBACK {
        return hits;
    }
    let window = &candles[candles.len() - CHART_LOOKBACK..];
    let close = window.last().map(|c| c.close).unwrap_or(0.0);
    if close <= 0.0 || !close.is_finite() {
        return hits;
    }

    let (highs, lows) = swings(window);

    // Support / resistance touch: close within tolerance of a swing level.
    if let Some(&support) = lows
        .iter()
        .filter(|l| **l < close * (1.0 + LEVEL_TOLERANCE))
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    {
        if near(close, support, close) {
            hits.push(PatternHit {
                name: "support_touch",
                direction: Direction::Long,
                expected_move: 0.008,
                confidence: 0.45,
            });
        }
    }
    if let Some(&resistance) = highs
        .iter()
        .filter(|h| **h > close * (1.0 - LEVEL_TOLERANCE))
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    {
        if near(close, resistance, close) {
            hits.push(PatternHit {
                name: "resistance_touch",
                direction: Direction::Short,
                expected_move: 0.008,
                confidence: 0.45,
            });
        }
    }

    // Double top / bottom: two matching swing extremes.
    if highs.len() >= 2 {
        let (a, b) = (highs[highs.len() - 2], highs[highs.len() - 1]);
        if near(a, b, close) && close < a {
            hits.push(PatternHit {
                name: "double_top",
                direction: Direction::Short,
                expected_move: 0.015,
                confidence: 0.55,
            });
        }
    }
    if lows.len() >= 2 {
        let (a, b) = (lows[lows.len() - 2], lows[lows.len() - 1]);
        if near(a, b, close) && close > a {
            hits.push(PatternHit {
                name: "double_bottom",
                direction: Direction::Long,
                expected_move: 0.015,
                confidence: 0.55,
            });
        }
    }

    // Triangles from the slopes of successive swing highs and lows.
    if highs.len() >= 3 && lows.len() >= 3 {
        let high_slope = trend_of(&highs);
        let low_slope = trend_of(&lows);
        let flat = close * 0.0005;
        if high_slope.abs() <= flat && low_slope > flat {
            hits.push(PatternHit {
                name: "ascending_triangle",
                direction: Direction::Long,
                expected_move: 0.012,
                confidence: 0.5,
            });
        } else if low_slope.abs() <= flat && high_slope < -flat {
            hits.push(PatternHit {
                name: "descending_triangle",
                direction: Direction::Short,
                expected_move: 0.012,
                confidence: 0.5,
            });
        } else if high_slope < -flat && low_slope > flat {
            hits.push(PatternHit {
                name: "symmetrical_triangle",
                direction: Direction::Neutral,
                expected_move: 0.01,
                confidence: 0.4,
            });
        }
    }

    hits
}

/// Mean step between successive values (simple slope proxy).
fn trend_of(levels: &[f64]) -> f64 {
    if levels.len() < 2 {
        return 0.0;
    }
    let steps: f64 = levels.windows(2).map(|w| w[1] - w[0]).sum();
    steps / (levels.len() - 1) as f64
}

// ---------------------------------------------------------------------------
// Indicator patterns
// ---------------------------------------------------------------------------

fn indicator_patterns(ind: &IndicatorSet) -> Vec<PatternHit> {
    let mut hits = Vec::new();

    // RSI divergence: price direction and RSI direction disagree over ~10 bars.
    if let (Some(rsi_now), Some(rsi_then)) = (
        finite_at_back(&ind.rsi_14_series, 0),
        finite_at_back(&ind.rsi_14_series, 10),
    ) {
        let price_now = ind.last_close;
        if let Some(price_then) = ind
            .bollinger_series
            .middle
            .len()
            .checked_sub(11)
            .and_then(|i| {
                let v = ind.bollinger_series.middle[i];
                v.is_finite().then_some(v)
            })
        {
            let price_up = price_now > price_then;
            let rsi_up = rsi_now > rsi_then;
            if price_up && !rsi_up && rsi_then > 60.0 {
                hits.push(PatternHit {
                    name: "bearish_rsi_divergence",
                    direction: Direction::Short,
                    expected_move: 0.01,
                    confidence: 0.5,
                });
            } else if !price_up && rsi_up && rsi_then < 40.0 {
                hits.push(PatternHit {
                    name: "bullish_rsi_divergence",
                    direction: Direction::Long,
                    expected_move: 0.01,
                    confidence: 0.5,
                });
            }
        }
    }

    // MACD cross: histogram sign flip on the last bar.
    if let (Some(hist_now), Some(hist_prev)) = (
        finite_at_back(&ind.macd_series.histogram, 0),
        finite_at_back(&ind.macd_series.histogram, 1),
    ) {
        if hist_prev <= 0.0 && hist_now > 0.0 {
            hits.push(PatternHit {
                name: "macd_bullish_cross",
                direction: Direction::Long,
                expected_move: 0.008,
                confidence: 0.55,
            });
        } else if hist_prev >= 0.0 && hist_now < 0.0 {
            hits.push(PatternHit {
                name: "macd_bearish_cross",
                direction: Direction::Short,
                expected_move: 0.008,
                confidence: 0.55,
            });
        }
    }

    // Bollinger squeeze: width in the bottom quarter of its recent range.
    if let Some(width_now) = ind.bollinger_width {
        let recent: Vec<f64> = ind
            .bollinger_series
            .width
            .iter()
            .rev()
            .take(50)
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if recent.len() >= 20 {
            let max = recent.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = recent.iter().copied().fold(f64::INFINITY, f64::min);
            if max > min && (width_now - min) / (max - min) < 0.25 {
                hits.push(PatternHit {
                    name: "bollinger_squeeze",
                    direction: Direction::Neutral,
                    expected_move: 0.012,
                    confidence: 0.4,
                });
            }
        }
    }

    hits
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    fn flat_prefix(n: usize) -> Vec<Candle> {
        (0..n).map(|_| candle(100.0, 101.0, 99.0, 100.0)).collect()
    }

    #[test]
    fn hammer_after_decline() {
        let mut candles = vec![
            candle(104.0, 105.0, 103.0, 103.2),
            candle(103.0, 103.5, 101.8, 102.0),
        ];
        // Long lower shadow, small body near the top.
        candles.push(candle(101.9, 102.1, 99.0, 102.05));
        let hits = candlestick_patterns(&candles);
        assert!(hits.iter().any(|h| h.name == "hammer"));
    }

    #[test]
    fn doji_detected_on_tiny_body() {
        let candles = vec![
            candle(100.0, 101.0, 99.0, 100.5),
            candle(100.5, 101.5, 99.5, 100.4),
            candle(100.0, 101.0, 99.0, 100.05),
        ];
        let hits = candlestick_patterns(&candles);
        assert!(hits.iter().any(|h| h.name == "doji"));
    }

    #[test]
    fn bullish_engulfing() {
        let candles = vec![
            candle(101.0, 101.5, 100.0, 100.6),
            candle(100.8, 101.0, 99.9, 100.1), // red
            candle(100.0, 102.0, 99.8, 101.8), // green engulfing
        ];
        let hits = candlestick_patterns(&candles);
        assert!(hits.iter().any(|h| h.name == "bullish_engulfing"));
    }

    #[test]
    fn three_white_soldiers() {
        let candles = vec![
            candle(100.0, 101.2, 99.9, 101.0),
            candle(101.0, 102.2, 100.9, 102.0),
            candle(102.0, 103.2, 101.9, 103.0),
        ];
        let hits = candlestick_patterns(&candles);
        assert!(hits.iter().any(|h| h.name == "three_white_soldiers"));
    }

    #[test]
    fn three_black_crows() {
        let candles = vec![
            candle(103.0, 103.1, 101.8, 102.0),
            candle(102.0, 102.1, 100.8, 101.0),
            candle(101.0, 101.1, 99.8, 100.0),
        ];
        let hits = candlestick_patterns(&candles);
        assert!(hits.iter().any(|h| h.name == "three_black_crows"));
    }

    #[test]
    fn double_top_structure() {
        let mut candles = flat_prefix(45);
        // Two matching peaks with a dip between, close below the peaks.
        for peak in [0, 1] {
            candles.push(candle(100.0, 100.5, 99.5, 100.2));
            candles.push(candle(100.2, 106.0, 100.0, 105.0));
            candles.push(candle(105.0, 105.9, 104.0, 104.2));
            candles.push(candle(104.2, 104.4, 101.0, 101.5));
            if peak == 0 {
                candles.push(candle(101.5, 102.0, 100.5, 101.0));
            }
        }
        for _ in 0..12 {
            candles.push(candle(101.0, 101.8, 100.2, 101.0));
        }
        let hits = chart_patterns(&candles);
        assert!(
            hits.iter().any(|h| h.name == "double_top"),
            "hits: {:?}",
            hits.iter().map(|h| h.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn conflicting_patterns_are_half_weighted() {
        let bullish = PatternHit {
            name: "bullish_engulfing",
            direction: Direction::Long,
            expected_move: 0.012,
            confidence: 0.6,
        };
        // Same hit folded with and against the MTF direction.
        let with = fold(&[bullish.clone()], Direction::Long);
        let against = fold(&[bullish], Direction::Short);
        assert!((against.abs() - with.abs() * CONFLICT_WEIGHT).abs() < 1e-12);
    }

    fn fold(hits: &[PatternHit], mtf: Direction) -> f64 {
        let mut score = 0.0;
        for hit in hits {
            let contribution = hit.expected_move * hit.confidence * hit.direction.sign();
            let weight = if mtf == Direction::Neutral
                || hit.direction == Direction::Neutral
                || hit.direction == mtf
            {
                1.0
            } else {
                CONFLICT_WEIGHT
            };
            score += contribution * weight;
        }
        score
    }

    #[test]
    fn detect_is_bounded_and_total() {
        let candles: Vec<Candle> = (0..300)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 6.0;
                Candle::new(i as i64 * 60_000, base, base + 1.2, base - 1.2, base + 0.3, 100.0)
            })
            .collect();
        let indicators = IndicatorSet::compute(&candles);
        let result = detect(&candles, &indicators, Direction::Long);
        assert!((-1.0..=1.0).contains(&result.score));
        assert!(result.expected_move >= 0.0);
    }

    #[test]
    fn short_series_detects_nothing() {
        let candles = flat_prefix(2);
        let indicators = IndicatorSet::compute(&candles);
        let result = detect(&candles, &indicators, Direction::Neutral);
        assert!(result.hits.is_empty());
        assert_eq!(result.score, 0.0);
    }
}
