// =============================================================================
// Model heads — four simple learners behind one trait
// =============================================================================
//
// Heads:
//   forest_a / forest_b — bagged decision stumps over random feature splits
//                         (two independent seeds)
//   gradient_boost      — stumps fit sequentially on residuals
//   mlp                 — one tanh hidden layer trained by SGD
//
// Every head reports `is_trained`, holdout performance {mse, mae, r2,
// accuracy, prediction_count}, and per-feature importance. Head state is
// serde-serialisable so the ensemble can persist models to disk and restore
// them at startup.
//
// Targets are future returns clamped to [-1, 1]; predictions stay in that
// range.
// =============================================================================

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ml::FEATURE_NAMES;

/// Fraction of the dataset held out for performance measurement.
const HOLDOUT_FRACTION: f64 = 0.2;
/// Minimum rows required to train at all.
pub const MIN_TRAIN_ROWS: usize = 50;

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// Training rows: one feature vector and one realized-return target each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn push(&mut self, features: Vec<f64>, target: f64) {
        self.features.push(features);
        self.targets.push(target.clamp(-1.0, 1.0));
    }

    /// Chronological split: the newest `HOLDOUT_FRACTION` rows are holdout.
    fn split(&self) -> (Dataset, Dataset) {
        let holdout = ((self.len() as f64) * HOLDOUT_FRACTION).ceil() as usize;
        let cut = self.len().saturating_sub(holdout.max(1));
        let train = Dataset {
            features: self.features[..cut].to_vec(),
            targets: self.targets[..cut].to_vec(),
        };
        let test = Dataset {
            features: self.features[cut..].to_vec(),
            targets: self.targets[cut..].to_vec(),
        };
        (train, test)
    }
}

// ---------------------------------------------------------------------------
// Performance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadPerformance {
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
    /// Directional accuracy on the holdout.
    pub accuracy: f64,
    pub prediction_count: u64,
}

fn evaluate(predictions: &[f64], targets: &[f64]) -> HeadPerformance {
    let n = targets.len() as f64;
    if targets.is_empty() {
        return HeadPerformance::default();
    }
    let mse = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f64>()
        / n;
    let mae = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n;
    let mean = targets.iter().sum::<f64>() / n;
    let ss_tot: f64 = targets.iter().map(|t| (t - mean) * (t - mean)).sum();
    let ss_res: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (t - p) * (t - p))
        .sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    let accuracy = predictions
        .iter()
        .zip(targets)
        .filter(|(p, t)| p.signum() == t.signum() || (p.abs() < 1e-9 && t.abs() < 1e-9))
        .count() as f64
        / n;

    HeadPerformance {
        mse,
        mae,
        r2,
        accuracy,
        prediction_count: 0,
    }
}

// ---------------------------------------------------------------------------
// Head trait
// ---------------------------------------------------------------------------

pub trait ModelHead: Send + Sync {
    fn name(&self) -> &str;
    fn base_weight(&self) -> f64;
    fn is_trained(&self) -> bool;
    fn last_trained(&self) -> Option<DateTime<Utc>>;
    fn performance(&self) -> HeadPerformance;
    fn feature_importance(&self) -> Vec<(String, f64)>;

    /// Predict `(score, confidence)` for one feature vector.
    fn predict(&mut self, features: &[f64]) -> EngineResult<(f64, f64)>;

    /// Fit on `dataset`; updates holdout performance and the trained flag.
    fn train(&mut self, dataset: &Dataset) -> EngineResult<()>;

    /// Serialisable snapshot for persistence.
    fn to_state(&self) -> HeadState;
    fn restore(&mut self, state: HeadState);
}

/// Persisted form of any head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadState {
    pub name: String,
    pub trained: bool,
    pub last_trained: Option<DateTime<Utc>>,
    pub performance: HeadPerformance,
    pub stumps: Vec<Stump>,
    pub mlp: Option<MlpWeights>,
}

// ---------------------------------------------------------------------------
// Decision stumps (shared by the forest and boosting heads)
// ---------------------------------------------------------------------------

/// A single-threshold regressor on one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    pub left_value: f64,
    pub right_value: f64,
    /// Scale applied when summing (1.0 for bagging, learning-rate for
    /// boosting).
    pub scale: f64,
}

impl Stump {
    fn predict(&self, features: &[f64]) -> f64 {
        let value = features.get(self.feature).copied().unwrap_or(0.0);
        let out = if value <= self.threshold {
            self.left_value
        } else {
            self.right_value
        };
        out * self.scale
    }

    /// Best-fit stump for `(features, residuals)` on a random feature.
    fn fit(features: &[Vec<f64>], residuals: &[f64], rng: &mut StdRng, scale: f64) -> Self {
        let dims = features.first().map(|f| f.len()).unwrap_or(1);
        let feature = rng.gen_range(0..dims);
        let threshold = rng.gen_range(-0.8..0.8);

        let (mut left_sum, mut left_n) = (0.0, 0usize);
        let (mut right_sum, mut right_n) = (0.0, 0usize);
        for (row, &r) in features.iter().zip(residuals) {
            let v = row.get(feature).copied().unwrap_or(0.0);
            if v <= threshold {
                left_sum += r;
                left_n += 1;
            } else {
                right_sum += r;
                right_n += 1;
            }
        }
        Self {
            feature,
            threshold,
            left_value: if left_n > 0 { left_sum / left_n as f64 } else { 0.0 },
            right_value: if right_n > 0 { right_sum / right_n as f64 } else { 0.0 },
            scale,
        }
    }
}

// ---------------------------------------------------------------------------
// StumpHead — forest (bagged) or boosted, by mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StumpMode {
    Bagged,
    Boosted,
}

pub struct StumpHead {
    name: String,
    base_weight: f64,
    mode: StumpMode,
    n_stumps: usize,
    seed: u64,
    stumps: Vec<Stump>,
    trained: bool,
    last_trained: Option<DateTime<Utc>>,
    performance: HeadPerformance,
}

impl StumpHead {
    pub fn forest(name: &str, base_weight: f64, seed: u64) -> Self {
        Self {
            name: name.to_string(),
            base_weight,
            mode: StumpMode::Bagged,
            n_stumps: 40,
            seed,
            stumps: Vec::new(),
            trained: false,
            last_trained: None,
            performance: HeadPerformance::default(),
        }
    }

    pub fn boosted(name: &str, base_weight: f64, seed: u64) -> Self {
        Self {
            name: name.to_string(),
            base_weight,
            mode: StumpMode::Boosted,
            n_stumps: 60,
            seed,
            stumps: Vec::new(),
            trained: false,
            last_trained: None,
            performance: HeadPerformance::default(),
        }
    }

    fn raw_predict(stumps: &[Stump], mode: StumpMode, features: &[f64]) -> f64 {
        if stumps.is_empty() {
            return 0.0;
        }
        let sum: f64 = stumps.iter().map(|s| s.predict(features)).sum();
        let raw = match mode {
            StumpMode::Bagged => sum / stumps.len() as f64,
            StumpMode::Boosted => sum,
        };
        raw.clamp(-1.0, 1.0)
    }
}

impl ModelHead for StumpHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_weight(&self) -> f64 {
        self.base_weight
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn last_trained(&self) -> Option<DateTime<Utc>> {
        self.last_trained
    }

    fn performance(&self) -> HeadPerformance {
        self.performance.clone()
    }

    fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut counts = vec![0.0; FEATURE_NAMES.len()];
        for stump in &self.stumps {
            if let Some(c) = counts.get_mut(stump.feature) {
                *c += (stump.left_value - stump.right_value).abs() * stump.scale;
            }
        }
        let total: f64 = counts.iter().sum();
        FEATURE_NAMES
            .iter()
            .zip(counts)
            .map(|(name, c)| {
                (
                    name.to_string(),
                    if total > 0.0 { c / total } else { 0.0 },
                )
            })
            .collect()
    }

    fn predict(&mut self, features: &[f64]) -> EngineResult<(f64, f64)> {
        if !self.trained {
            return Err(EngineError::MlModel(format!("{} is untrained", self.name)));
        }
        self.performance.prediction_count += 1;
        let score = Self::raw_predict(&self.stumps, self.mode, features);
        // Confidence follows holdout accuracy, floored for a trained head.
        let confidence = self.performance.accuracy.clamp(0.2, 0.95);
        Ok((score, confidence))
    }

    fn train(&mut self, dataset: &Dataset) -> EngineResult<()> {
        if dataset.len() < MIN_TRAIN_ROWS {
            return Err(EngineError::MlModel(format!(
                "{}: {} rows < {MIN_TRAIN_ROWS}",
                self.name,
                dataset.len()
            )));
        }

        let (train, holdout) = dataset.split();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut stumps = Vec::with_capacity(self.n_stumps);

        match self.mode {
            StumpMode::Bagged => {
                // Each stump fits the raw targets on a bootstrap sample.
                for _ in 0..self.n_stumps {
                    let sample: Vec<usize> = (0..train.len())
                        .map(|_| rng.gen_range(0..train.len()))
                        .collect();
                    let feats: Vec<Vec<f64>> =
                        sample.iter().map(|&i| train.features[i].clone()).collect();
                    let targets: Vec<f64> = sample.iter().map(|&i| train.targets[i]).collect();
                    stumps.push(Stump::fit(&feats, &targets, &mut rng, 1.0));
                }
            }
            StumpMode::Boosted => {
                // Sequential residual fitting with a fixed learning rate.
                const LEARNING_RATE: f64 = 0.15;
                let mut residuals = train.targets.clone();
                for _ in 0..self.n_stumps {
                    let stump = Stump::fit(&train.features, &residuals, &mut rng, LEARNING_RATE);
                    for (row, r) in train.features.iter().zip(residuals.iter_mut()) {
                        *r -= stump.predict(row);
                    }
                    stumps.push(stump);
                }
            }
        }

        let predictions: Vec<f64> = holdout
            .features
            .iter()
            .map(|row| Self::raw_predict(&stumps, self.mode, row))
            .collect();
        let mut performance = evaluate(&predictions, &holdout.targets);
        performance.prediction_count = self.performance.prediction_count;

        self.stumps = stumps;
        self.performance = performance;
        self.trained = true;
        self.last_trained = Some(Utc::now());
        Ok(())
    }

    fn to_state(&self) -> HeadState {
        HeadState {
            name: self.name.clone(),
            trained: self.trained,
            last_trained: self.last_trained,
            performance: self.performance.clone(),
            stumps: self.stumps.clone(),
            mlp: None,
        }
    }

    fn restore(&mut self, state: HeadState) {
        self.trained = state.trained;
        self.last_trained = state.last_trained;
        self.performance = state.performance;
        self.stumps = state.stumps;
    }
}

// ---------------------------------------------------------------------------
// MlpHead — one tanh hidden layer, SGD
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpWeights {
    /// hidden x input
    pub w1: Vec<Vec<f64>>,
    pub b1: Vec<f64>,
    /// output x hidden
    pub w2: Vec<f64>,
    pub b2: f64,
}

pub struct MlpHead {
    name: String,
    base_weight: f64,
    hidden: usize,
    epochs: usize,
    learning_rate: f64,
    seed: u64,
    weights: Option<MlpWeights>,
    last_trained: Option<DateTime<Utc>>,
    performance: HeadPerformance,
}

impl MlpHead {
    pub fn new(name: &str, base_weight: f64, seed: u64) -> Self {
        Self {
            name: name.to_string(),
            base_weight,
            hidden: 8,
            epochs: 60,
            learning_rate: 0.02,
            seed,
            weights: None,
            last_trained: None,
            performance: HeadPerformance::default(),
        }
    }

    fn forward(weights: &MlpWeights, features: &[f64]) -> (Vec<f64>, f64) {
        let hidden: Vec<f64> = weights
            .w1
            .iter()
            .zip(&weights.b1)
            .map(|(row, b)| {
                let z: f64 = row
                    .iter()
                    .zip(features)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + b;
                z.tanh()
            })
            .collect();
        let out = hidden
            .iter()
            .zip(&weights.w2)
            .map(|(h, w)| h * w)
            .sum::<f64>()
            + weights.b2;
        (hidden, out.tanh())
    }
}

impl ModelHead for MlpHead {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_weight(&self) -> f64 {
        self.base_weight
    }

    fn is_trained(&self) -> bool {
        self.weights.is_some()
    }

    fn last_trained(&self) -> Option<DateTime<Utc>> {
        self.last_trained
    }

    fn performance(&self) -> HeadPerformance {
        self.performance.clone()
    }

    fn feature_importance(&self) -> Vec<(String, f64)> {
        let Some(weights) = &self.weights else {
            return FEATURE_NAMES.iter().map(|n| (n.to_string(), 0.0)).collect();
        };
        // Input importance ~= sum of |w1| down each input column.
        let dims = weights.w1.first().map(|r| r.len()).unwrap_or(0);
        let mut sums = vec![0.0; dims];
        for row in &weights.w1 {
            for (i, w) in row.iter().enumerate() {
                sums[i] += w.abs();
            }
        }
        let total: f64 = sums.iter().sum();
        FEATURE_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let v = sums.get(i).copied().unwrap_or(0.0);
                (
                    name.to_string(),
                    if total > 0.0 { v / total } else { 0.0 },
                )
            })
            .collect()
    }

    fn predict(&mut self, features: &[f64]) -> EngineResult<(f64, f64)> {
        let Some(weights) = &self.weights else {
            return Err(EngineError::MlModel(format!("{} is untrained", self.name)));
        };
        self.performance.prediction_count += 1;
        let (_, out) = Self::forward(weights, features);
        let confidence = self.performance.accuracy.clamp(0.2, 0.95);
        Ok((out, confidence))
    }

    fn train(&mut self, dataset: &Dataset) -> EngineResult<()> {
        if dataset.len() < MIN_TRAIN_ROWS {
            return Err(EngineError::MlModel(format!(
                "{}: {} rows < {MIN_TRAIN_ROWS}",
                self.name,
                dataset.len()
            )));
        }
        let (train, holdout) = dataset.split();
        let dims = train.features.first().map(|f| f.len()).unwrap_or(0);
        if dims == 0 {
            return Err(EngineError::MlModel("empty feature vectors".into()));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut weights = MlpWeights {
            w1: (0..self.hidden)
                .map(|_| (0..dims).map(|_| rng.gen_range(-0.3..0.3)).collect())
                .collect(),
            b1: vec![0.0; self.hidden],
            w2: (0..self.hidden).map(|_| rng.gen_range(-0.3..0.3)).collect(),
            b2: 0.0,
        };

        for _ in 0..self.epochs {
            for (row, &target) in train.features.iter().zip(&train.targets) {
                let (hidden, out) = Self::forward(&weights, row);
                // d(loss)/d(out_pre) for tanh output with squared loss.
                let err = out - target;
                let dout = err * (1.0 - out * out);

                for (j, h) in hidden.iter().enumerate() {
                    let dw2 = dout * h;
                    let dh = dout * weights.w2[j] * (1.0 - h * h);
                    weights.w2[j] -= self.learning_rate * dw2;
                    for (i, x) in row.iter().enumerate() {
                        weights.w1[j][i] -= self.learning_rate * dh * x;
                    }
                    weights.b1[j] -= self.learning_rate * dh;
                }
                weights.b2 -= self.learning_rate * dout;
            }
        }

        let predictions: Vec<f64> = holdout
            .features
            .iter()
            .map(|row| Self::forward(&weights, row).1)
            .collect();
        let mut performance = evaluate(&predictions, &holdout.targets);
        performance.prediction_count = self.performance.prediction_count;

        self.weights = Some(weights);
        self.performance = performance;
        self.last_trained = Some(Utc::now());
        Ok(())
    }

    fn to_state(&self) -> HeadState {
        HeadState {
            name: self.name.clone(),
            trained: self.weights.is_some(),
            last_trained: self.last_trained,
            performance: self.performance.clone(),
            stumps: Vec::new(),
            mlp: self.weights.clone(),
        }
    }

    fn restore(&mut self, state: HeadState) {
        self.weights = state.mlp;
        self.last_trained = state.last_trained;
        self.performance = state.performance;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Dataset where target tracks feature 0 (plus small structure noise).
    fn learnable_dataset(rows: usize) -> Dataset {
        let mut data = Dataset::default();
        for i in 0..rows {
            let x = ((i % 21) as f64 - 10.0) / 10.0;
            let mut features = vec![0.0; FEATURE_NAMES.len()];
            features[0] = x;
            features[1] = -x * 0.5;
            data.push(features, x * 0.8);
        }
        data
    }

    #[test]
    fn untrained_head_refuses_prediction() {
        let mut head = StumpHead::forest("forest_a", 1.0, 1);
        let err = head.predict(&vec![0.0; FEATURE_NAMES.len()]).unwrap_err();
        assert_eq!(err.kind(), "ml_model");
    }

    #[test]
    fn too_few_rows_is_an_error() {
        let mut head = StumpHead::boosted("gb", 1.0, 2);
        let small = learnable_dataset(10);
        assert!(head.train(&small).is_err());
        assert!(!head.is_trained());
    }

    #[test]
    fn forest_learns_monotone_relation() {
        let mut head = StumpHead::forest("forest_a", 1.0, 7);
        head.train(&learnable_dataset(400)).unwrap();
        assert!(head.is_trained());

        let mut up = vec![0.0; FEATURE_NAMES.len()];
        up[0] = 0.9;
        let mut down = vec![0.0; FEATURE_NAMES.len()];
        down[0] = -0.9;
        let (up_score, _) = head.predict(&up).unwrap();
        let (down_score, _) = head.predict(&down).unwrap();
        assert!(up_score > down_score);
    }

    #[test]
    fn boosted_head_beats_noise_on_holdout() {
        let mut head = StumpHead::boosted("gb", 1.2, 13);
        head.train(&learnable_dataset(400)).unwrap();
        let perf = head.performance();
        assert!(perf.accuracy > 0.6, "accuracy {}", perf.accuracy);
        assert!(perf.r2 > 0.0, "r2 {}", perf.r2);
    }

    #[test]
    fn mlp_learns_and_bounds_output() {
        let mut head = MlpHead::new("mlp", 0.8, 3);
        head.train(&learnable_dataset(400)).unwrap();
        let mut probe = vec![0.0; FEATURE_NAMES.len()];
        probe[0] = 1.0;
        let (score, confidence) = head.predict(&probe).unwrap();
        assert!((-1.0..=1.0).contains(&score));
        assert!((0.0..=1.0).contains(&confidence));
        assert!(score > 0.0, "expected positive score, got {score}");
    }

    #[test]
    fn deterministic_training_given_seed() {
        let mut a = StumpHead::forest("fa", 1.0, 42);
        let mut b = StumpHead::forest("fb", 1.0, 42);
        let data = learnable_dataset(200);
        a.train(&data).unwrap();
        b.train(&data).unwrap();
        let probe = {
            let mut f = vec![0.0; FEATURE_NAMES.len()];
            f[0] = 0.5;
            f
        };
        assert_eq!(a.predict(&probe).unwrap().0, b.predict(&probe).unwrap().0);
    }

    #[test]
    fn state_roundtrip_restores_prediction() {
        let mut head = StumpHead::boosted("gb", 1.0, 5);
        head.train(&learnable_dataset(300)).unwrap();
        let probe = {
            let mut f = vec![0.0; FEATURE_NAMES.len()];
            f[0] = 0.7;
            f
        };
        let before = head.predict(&probe).unwrap().0;

        let state = head.to_state();
        let json = serde_json::to_string(&state).unwrap();
        let decoded: HeadState = serde_json::from_str(&json).unwrap();

        let mut fresh = StumpHead::boosted("gb", 1.0, 5);
        fresh.restore(decoded);
        assert!(fresh.is_trained());
        assert_eq!(fresh.predict(&probe).unwrap().0, before);
    }

    #[test]
    fn feature_importance_sums_to_one_when_trained() {
        let mut head = StumpHead::forest("fa", 1.0, 11);
        head.train(&learnable_dataset(300)).unwrap();
        let total: f64 = head.feature_importance().iter().map(|(_, v)| v).sum();
        assert!((total - 1.0).abs() < 1e-9);
        // Feature 0 drives the target; it should dominate.
        let (name, top) = head
            .feature_importance()
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        assert_eq!(name, FEATURE_NAMES[0]);
        assert!(top > 0.2);
    }
}
