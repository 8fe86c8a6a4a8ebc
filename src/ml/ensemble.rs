// =============================================================================
// MlEnsemble — weighted voting over four heads with a technical fallback
// =============================================================================
//
// Per-head weight = base_weight x head_confidence x performance_weight,
// where performance_weight = clamp((r2 + 1) / 2, 0.1, 1.0). The final score
// is the weight-normalised average; ensemble confidence is
//
//   0.7 * mean(head confidences) + 0.3 * agreement,
//   agreement = 1 - clamp(stddev(head scores), 0, 1).
//
// A failed or untrained head simply drops out (weights renormalise). With no
// trained heads at all the ensemble answers with a deterministic heuristic
// from RSI, Bollinger position, and MACD sign at low confidence, so callers
// always receive a valid tuple.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::indicators::IndicatorSet;
use crate::ml::heads::{Dataset, HeadState, MlpHead, ModelHead, StumpHead};
use crate::ml::Prediction;

/// Upper bound on fallback confidence.
const FALLBACK_MAX_CONFIDENCE: f64 = 0.4;

pub struct MlEnsemble {
    heads: Mutex<Vec<Box<dyn ModelHead>>>,
    model_dir: PathBuf,
    retrain_after_hours: i64,
}

impl MlEnsemble {
    /// Standard four-head ensemble. `model_dir` holds one JSON state file
    /// per head.
    pub fn new(model_dir: impl Into<PathBuf>, retrain_after_hours: i64) -> Self {
        let heads: Vec<Box<dyn ModelHead>> = vec![
            Box::new(StumpHead::forest("forest_a", 1.0, 17)),
            Box::new(StumpHead::forest("forest_b", 1.0, 29)),
            Box::new(StumpHead::boosted("gradient_boost", 1.2, 41)),
            Box::new(MlpHead::new("mlp", 0.8, 53)),
        ];
        Self {
            heads: Mutex::new(heads),
            model_dir: model_dir.into(),
            retrain_after_hours,
        }
    }

    // -------------------------------------------------------------------------
    // Prediction
    // -------------------------------------------------------------------------

    /// Predict from the trained heads, or fall back to the heuristic.
    pub fn predict(&self, features: &[f64], indicators: &IndicatorSet) -> Prediction {
        let mut heads = self.heads.lock();

        let mut scores = Vec::new();
        let mut confidences = Vec::new();
        let mut weights = Vec::new();
        let mut per_model = Vec::new();

        for head in heads.iter_mut() {
            if !head.is_trained() {
                continue;
            }
            match head.predict(features) {
                Ok((score, confidence)) => {
                    let perf = head.performance();
                    let performance_weight = ((perf.r2 + 1.0) / 2.0).clamp(0.1, 1.0);
                    let weight = head.base_weight() * confidence * performance_weight;
                    scores.push(score);
                    confidences.push(confidence);
                    weights.push(weight);
                    per_model.push((head.name().to_string(), score, confidence));
                }
                Err(e) => {
                    warn!(head = head.name(), error = %e, "head prediction failed — dropping from vote");
                }
            }
        }
        drop(heads);

        if scores.is_empty() {
            return Self::heuristic_fallback(indicators);
        }

        let weight_sum: f64 = weights.iter().sum();
        let score = if weight_sum > 0.0 {
            scores
                .iter()
                .zip(&weights)
                .map(|(s, w)| s * w)
                .sum::<f64>()
                / weight_sum
        } else {
            0.0
        };

        let mean_confidence = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let agreement = 1.0 - stddev(&scores).clamp(0.0, 1.0);
        let confidence = (0.7 * mean_confidence + 0.3 * agreement).clamp(0.0, 1.0);

        Prediction {
            score: score.clamp(-1.0, 1.0),
            confidence,
            per_model,
            is_fallback: false,
        }
    }

    /// Deterministic technical heuristic: RSI distance from 50, Bollinger
    /// position, MACD histogram sign. Confidence never exceeds 0.4.
    fn heuristic_fallback(indicators: &IndicatorSet) -> Prediction {
        let mut score: f64 = 0.0;
        let mut parts: f64 = 0.0;

        if let Some(rsi) = indicators.rsi_14 {
            score += (50.0 - rsi) / 50.0 * 0.4; // oversold -> positive
            parts += 1.0;
        }
        if let Some(pos) = indicators.price_position {
            score += -pos * 0.4; // lower band -> positive (mean reversion)
            parts += 1.0;
        }
        if let Some(hist) = indicators.macd_histogram {
            score += hist.signum() * 0.2;
            parts += 1.0;
        }

        let confidence = if parts > 0.0 {
            (0.15 + 0.08 * parts).min(FALLBACK_MAX_CONFIDENCE)
        } else {
            0.0
        };

        Prediction {
            score: score.clamp(-1.0, 1.0),
            confidence,
            per_model: vec![("heuristic".to_string(), score.clamp(-1.0, 1.0), confidence)],
            is_fallback: true,
        }
    }

    /// `true` when no head is trained (fusion collapses to technical+news).
    pub fn is_available(&self) -> bool {
        self.heads.lock().iter().any(|h| h.is_trained())
    }

    // -------------------------------------------------------------------------
    // Training
    // -------------------------------------------------------------------------

    /// `true` when any head is untrained or stale beyond the retrain window.
    pub fn should_retrain(&self) -> bool {
        let cutoff = Utc::now() - Duration::hours(self.retrain_after_hours);
        self.heads.lock().iter().any(|head| {
            !head.is_trained() || head.last_trained().map_or(true, |t| t < cutoff)
        })
    }

    /// Train every head on `dataset`. A failing head is logged and skipped;
    /// the ensemble keeps whatever heads succeed. Returns the per-head
    /// outcome report.
    pub fn train_all(&self, dataset: &Dataset) -> Vec<(String, Result<(), String>)> {
        let mut heads = self.heads.lock();
        let mut report = Vec::new();
        for head in heads.iter_mut() {
            let outcome = match head.train(dataset) {
                Ok(()) => {
                    let perf = head.performance();
                    info!(
                        head = head.name(),
                        rows = dataset.len(),
                        r2 = perf.r2,
                        accuracy = perf.accuracy,
                        "head trained"
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!(head = head.name(), error = %e, "head training failed");
                    Err(e.to_string())
                }
            };
            report.push((head.name().to_string(), outcome));
        }
        report
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn state_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.json"))
    }

    /// Persist every trained head to the model directory.
    pub fn save(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.model_dir).map_err(|e| {
            crate::error::EngineError::Internal(format!("create model dir: {e}"))
        })?;
        let heads = self.heads.lock();
        for head in heads.iter() {
            if !head.is_trained() {
                continue;
            }
            let state = head.to_state();
            let path = Self::state_path(&self.model_dir, head.name());
            let json = serde_json::to_string(&state).map_err(|e| {
                crate::error::EngineError::Internal(format!("serialize head state: {e}"))
            })?;
            std::fs::write(&path, json).map_err(|e| {
                crate::error::EngineError::Internal(format!("write {}: {e}", path.display()))
            })?;
        }
        debug!(dir = %self.model_dir.display(), "models persisted");
        Ok(())
    }

    /// Restore any persisted head states. Missing or corrupt files leave the
    /// corresponding head untrained.
    pub fn load(&self) {
        let mut heads = self.heads.lock();
        for head in heads.iter_mut() {
            let path = Self::state_path(&self.model_dir, head.name());
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<HeadState>(&raw) {
                Ok(state) => {
                    head.restore(state);
                    debug!(head = head.name(), "model state restored");
                }
                Err(e) => warn!(head = head.name(), error = %e, "corrupt model state ignored"),
            }
        }
    }

    /// Snapshot of head status for `/status`.
    pub fn head_summary(&self) -> Vec<(String, bool, f64)> {
        self.heads
            .lock()
            .iter()
            .map(|h| (h.name().to_string(), h.is_trained(), h.performance().r2))
            .collect()
    }
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::ml::FEATURE_NAMES;

    fn indicators() -> IndicatorSet {
        let candles: Vec<Candle> = (0..250)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.2).sin() * 5.0;
                Candle::new(i as i64 * 60_000, base, base + 1.0, base - 1.0, base, 100.0)
            })
            .collect();
        IndicatorSet::compute(&candles)
    }

    fn learnable_dataset(rows: usize) -> Dataset {
        let mut data = Dataset::default();
        for i in 0..rows {
            let x = ((i % 21) as f64 - 10.0) / 10.0;
            let mut features = vec![0.0; FEATURE_NAMES.len()];
            features[0] = x;
            data.push(features, x * 0.8);
        }
        data
    }

    #[test]
    fn untrained_ensemble_uses_fallback() {
        let ensemble = MlEnsemble::new(std::env::temp_dir().join("borealis-none"), 24);
        assert!(!ensemble.is_available());

        let prediction = ensemble.predict(&vec![0.0; FEATURE_NAMES.len()], &indicators());
        assert!(prediction.is_fallback);
        assert!(prediction.confidence <= FALLBACK_MAX_CONFIDENCE);
        assert!((-1.0..=1.0).contains(&prediction.score));
    }

    #[test]
    fn should_retrain_when_untrained() {
        let ensemble = MlEnsemble::new(std::env::temp_dir().join("borealis-none"), 24);
        assert!(ensemble.should_retrain());
    }

    #[test]
    fn training_enables_weighted_vote() {
        let ensemble = MlEnsemble::new(std::env::temp_dir().join("borealis-train"), 24);
        let report = ensemble.train_all(&learnable_dataset(400));
        assert_eq!(report.len(), 4);
        assert!(report.iter().all(|(_, r)| r.is_ok()));
        assert!(ensemble.is_available());
        assert!(!ensemble.should_retrain());

        let mut probe = vec![0.0; FEATURE_NAMES.len()];
        probe[0] = 0.9;
        let up = ensemble.predict(&probe, &indicators());
        probe[0] = -0.9;
        let down = ensemble.predict(&probe, &indicators());
        assert!(!up.is_fallback);
        assert_eq!(up.per_model.len(), 4);
        assert!(up.score > down.score);
        assert!((0.0..=1.0).contains(&up.confidence));
    }

    #[test]
    fn failed_training_keeps_working_heads() {
        let ensemble = MlEnsemble::new(std::env::temp_dir().join("borealis-small"), 24);
        // Too-small dataset: every head refuses, ensemble stays on fallback.
        let report = ensemble.train_all(&learnable_dataset(10));
        assert!(report.iter().all(|(_, r)| r.is_err()));
        assert!(!ensemble.is_available());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("borealis-ml-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let ensemble = MlEnsemble::new(&dir, 24);
        ensemble.train_all(&learnable_dataset(300));
        let mut probe = vec![0.0; FEATURE_NAMES.len()];
        probe[0] = 0.8;
        let before = ensemble.predict(&probe, &indicators()).score;
        ensemble.save().unwrap();

        let restored = MlEnsemble::new(&dir, 24);
        restored.load();
        assert!(restored.is_available());
        let after = restored.predict(&probe, &indicators()).score;
        assert!((before - after).abs() < 1e-9);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn agreement_raises_confidence() {
        // Hand-check the confidence formula on synthetic inputs.
        let tight = 1.0 - stddev(&[0.5, 0.52, 0.48]).clamp(0.0, 1.0);
        let wide = 1.0 - stddev(&[0.9, -0.8, 0.1]).clamp(0.0, 1.0);
        assert!(tight > wide);
    }
}
