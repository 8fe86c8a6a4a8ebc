// =============================================================================
// Multi-Timeframe Combiner
// =============================================================================
//
// Per-timeframe verdicts are combined by their configured weights:
//
//   score            — weighted average of timeframe scores
//   confidence       — weighted average of timeframe confidences
//   alignment_score  — fraction of timeframe WEIGHT agreeing with the
//                      combined direction
//   divergence       — a strongly positive ( > +0.3 ) and a strongly
//                      negative ( < -0.3 ) timeframe coexist
//
// The result is `aligned` when alignment_score clears the symbol's agreement
// ratio and no divergence exists; otherwise the confidence is penalised
// multiplicatively (x0.7 misaligned, x0.8 divergent).
// =============================================================================

use serde::Serialize;

use crate::signal::TimeframeVerdict;
use crate::types::Direction;

/// Score magnitude at which a timeframe counts as "strong" for divergence.
const DIVERGENCE_THRESHOLD: f64 = 0.3;
/// Confidence penalty when alignment fails.
const MISALIGNMENT_PENALTY: f64 = 0.7;
/// Confidence penalty when divergence is detected.
const DIVERGENCE_PENALTY: f64 = 0.8;

/// Combined multi-timeframe view.
#[derive(Debug, Clone, Serialize)]
pub struct MtfResult {
    pub direction: Direction,
    /// [-1, 1]
    pub score: f64,
    /// [0, 100], penalties applied.
    pub confidence: f64,
    /// [0, 1]
    pub alignment_score: f64,
    pub divergence: bool,
    pub aligned: bool,
    /// (timeframe, verdict) pairs for audit.
    pub per_timeframe: Vec<(String, TimeframeVerdict)>,
}

impl MtfResult {
    pub fn empty() -> Self {
        Self {
            direction: Direction::Neutral,
            score: 0.0,
            confidence: 0.0,
            alignment_score: 0.0,
            divergence: false,
            aligned: false,
            per_timeframe: Vec::new(),
        }
    }
}

/// Combine `(timeframe, weight, verdict)` rows. `agreement_required` is the
/// symbol's timeframe-agreement ratio.
pub fn combine(
    verdicts: &[(String, f64, TimeframeVerdict)],
    agreement_required: f64,
) -> MtfResult {
    let weight_total: f64 = verdicts.iter().map(|(_, w, _)| w).sum();
    if verdicts.is_empty() || weight_total <= 0.0 {
        return MtfResult::empty();
    }

    let score = verdicts
        .iter()
        .map(|(_, w, v)| w * v.score)
        .sum::<f64>()
        / weight_total;
    let mut confidence = verdicts
        .iter()
        .map(|(_, w, v)| w * v.confidence)
        .sum::<f64>()
        / weight_total;

    let direction = Direction::from_score(score);

    // Fraction of weight agreeing with the combined direction.
    let alignment_score = if direction == Direction::Neutral {
        0.0
    } else {
        verdicts
            .iter()
            .filter(|(_, _, v)| v.direction == direction)
            .map(|(_, w, _)| w)
            .sum::<f64>()
            / weight_total
    };

    let strongly_positive = verdicts.iter().any(|(_, _, v)| v.score > DIVERGENCE_THRESHOLD);
    let strongly_negative = verdicts
        .iter()
        .any(|(_, _, v)| v.score < -DIVERGENCE_THRESHOLD);
    let divergence = strongly_positive && strongly_negative;

    let aligned = alignment_score >= agreement_required && !divergence;
    if !aligned {
        if divergence {
            confidence *= DIVERGENCE_PENALTY;
        }
        if alignment_score < agreement_required {
            confidence *= MISALIGNMENT_PENALTY;
        }
    }

    MtfResult {
        direction,
        score: score.clamp(-1.0, 1.0),
        confidence: confidence.clamp(0.0, 100.0),
        alignment_score,
        divergence,
        aligned,
        per_timeframe: verdicts
            .iter()
            .map(|(tf, _, v)| (tf.clone(), *v))
            .collect(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(direction: Direction, score: f64, confidence: f64) -> TimeframeVerdict {
        TimeframeVerdict {
            direction,
            score,
            confidence,
        }
    }

    fn rows(
        entries: &[(&str, f64, Direction, f64, f64)],
    ) -> Vec<(String, f64, TimeframeVerdict)> {
        entries
            .iter()
            .map(|(tf, w, d, s, c)| (tf.to_string(), *w, verdict(*d, *s, *c)))
            .collect()
    }

    #[test]
    fn unanimous_timeframes_fully_aligned() {
        let result = combine(
            &rows(&[
                ("15m", 0.25, Direction::Long, 0.5, 70.0),
                ("1h", 0.35, Direction::Long, 0.6, 75.0),
                ("4h", 0.40, Direction::Long, 0.4, 65.0),
            ]),
            0.6,
        );
        assert_eq!(result.direction, Direction::Long);
        assert!((result.alignment_score - 1.0).abs() < 1e-12);
        assert!(result.aligned);
        assert!(!result.divergence);
        // No penalty applied.
        let expected = (0.25 * 70.0 + 0.35 * 75.0 + 0.40 * 65.0) / 1.0;
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn alignment_counts_weight_not_count() {
        // Two small timeframes long, one heavy timeframe short.
        let result = combine(
            &rows(&[
                ("15m", 0.1, Direction::Long, 0.2, 60.0),
                ("1h", 0.1, Direction::Long, 0.2, 60.0),
                ("4h", 0.8, Direction::Short, -0.25, 60.0),
            ]),
            0.6,
        );
        // Combined score is negative -> short; 0.8 of weight agrees.
        assert_eq!(result.direction, Direction::Short);
        assert!((result.alignment_score - 0.8).abs() < 1e-9);
        assert!(result.aligned);
    }

    #[test]
    fn divergence_requires_both_extremes() {
        let diverged = combine(
            &rows(&[
                ("15m", 0.5, Direction::Long, 0.6, 70.0),
                ("4h", 0.5, Direction::Short, -0.5, 70.0),
            ]),
            0.6,
        );
        assert!(diverged.divergence);
        assert!(!diverged.aligned);

        let mild = combine(
            &rows(&[
                ("15m", 0.5, Direction::Long, 0.6, 70.0),
                ("4h", 0.5, Direction::Short, -0.2, 70.0),
            ]),
            0.2,
        );
        assert!(!mild.divergence);
    }

    #[test]
    fn penalties_stack_multiplicatively() {
        // Divergent AND misaligned: both penalties apply.
        let result = combine(
            &rows(&[
                ("15m", 0.5, Direction::Long, 0.6, 80.0),
                ("4h", 0.5, Direction::Short, -0.6, 80.0),
            ]),
            0.9,
        );
        assert!(result.divergence);
        let expected = 80.0 * DIVERGENCE_PENALTY * MISALIGNMENT_PENALTY;
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn misalignment_only_penalty() {
        let result = combine(
            &rows(&[
                ("15m", 0.5, Direction::Long, 0.25, 80.0),
                ("4h", 0.5, Direction::Neutral, 0.0, 60.0),
            ]),
            0.8,
        );
        // Aligned weight = 0.5 < 0.8 required; no divergence.
        assert!(!result.divergence);
        assert!(!result.aligned);
        let expected = (0.5 * 80.0 + 0.5 * 60.0) * MISALIGNMENT_PENALTY;
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_input_is_neutral() {
        let result = combine(&[], 0.6);
        assert_eq!(result.direction, Direction::Neutral);
        assert_eq!(result.alignment_score, 0.0);
        assert!(!result.aligned);
    }
}
