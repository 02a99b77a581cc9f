//! Pairwise candidate ranker
//!
//! A linear RankNet-style model: for every receipt the positive should outscore
//! the negative, with logistic loss on the score difference. Each feature slot
//! is fed as a standardised value plus a missing indicator, so an absent value
//! only ever contributes through its indicator weight.

use crate::features::{FeatureVector, NUM_FEATURES};
use crate::sampling::LabeledPair;
use basket_recs_core::{PipelineError, RankerConfig, Result};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const INPUT_DIM: usize = 2 * NUM_FEATURES;

/// Scores a (context, candidate) feature vector; higher is better
pub trait Ranker {
    fn score(&self, features: &FeatureVector) -> f32;
}

/// Per-slot standardisation learned from the training vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    means: Vec<f32>,
    scales: Vec<f32>,
}

impl Standardizer {
    /// Mean and standard deviation of the present values of each slot
    pub fn fit<'a>(vectors: impl IntoIterator<Item = &'a FeatureVector>) -> Self {
        let mut sums = [0.0f64; NUM_FEATURES];
        let mut squares = [0.0f64; NUM_FEATURES];
        let mut counts = [0usize; NUM_FEATURES];

        for vector in vectors {
            for (slot, value) in vector.values().iter().enumerate() {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    sums[slot] += v as f64;
                    squares[slot] += (v as f64) * (v as f64);
                    counts[slot] += 1;
                }
            }
        }

        let mut means = vec![0.0f32; NUM_FEATURES];
        let mut scales = vec![1.0f32; NUM_FEATURES];
        for slot in 0..NUM_FEATURES {
            if counts[slot] == 0 {
                continue;
            }
            let n = counts[slot] as f64;
            let mean = sums[slot] / n;
            let variance = (squares[slot] / n - mean * mean).max(0.0);
            means[slot] = mean as f32;
            if variance > 1e-12 {
                scales[slot] = variance.sqrt() as f32;
            }
        }

        Self { means, scales }
    }

    /// Model input: standardised values followed by missing indicators
    pub fn transform(&self, features: &FeatureVector) -> Array1<f32> {
        let mut input = Array1::zeros(INPUT_DIM);
        for (slot, value) in features.values().iter().enumerate() {
            match value.filter(|v| v.is_finite()) {
                Some(v) => input[slot] = (v - self.means[slot]) / self.scales[slot],
                None => input[NUM_FEATURES + slot] = 1.0,
            }
        }
        input
    }
}

/// Trained pairwise ranker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseRanker {
    standardizer: Standardizer,
    weights: Array1<f32>,
}

impl PairwiseRanker {
    /// Train on labeled pairs with seeded SGD
    pub fn fit(pairs: &[LabeledPair], config: &RankerConfig) -> Result<Self> {
        if pairs.is_empty() {
            return Err(PipelineError::EmptyInput(
                "no training pairs for the ranker".to_string(),
            ));
        }

        let standardizer =
            Standardizer::fit(pairs.iter().flat_map(|p| [&p.positive, &p.negative]));
        let differences: Vec<Array1<f32>> = pairs
            .iter()
            .map(|p| standardizer.transform(&p.positive) - standardizer.transform(&p.negative))
            .collect();

        let mut weights = Array1::<f32>::zeros(INPUT_DIM);
        let mut order: Vec<usize> = (0..differences.len()).collect();
        let mut rng = StdRng::seed_from_u64(config.seed);

        for epoch in 0..config.epochs {
            order.shuffle(&mut rng);
            let mut loss = 0.0f64;

            for &i in &order {
                let diff = &differences[i];
                let margin = weights.dot(diff);
                // d/dw ln(1 + e^{-m}) = -sigmoid(-m) * diff
                let coefficient = sigmoid(-margin);
                weights.zip_mut_with(diff, |w, &d| {
                    *w += config.learning_rate * (coefficient * d - config.l2 * *w);
                });
                loss += softplus(-margin) as f64;
            }

            let mean_loss = loss / differences.len() as f64;
            if !mean_loss.is_finite() {
                return Err(PipelineError::Numerical(format!(
                    "ranker loss diverged at epoch {epoch}"
                )));
            }
            debug!(epoch, loss = mean_loss, "Ranker epoch");
        }

        let ranker = Self {
            standardizer,
            weights,
        };
        info!(
            pairs = pairs.len(),
            epochs = config.epochs,
            pairwise_accuracy = ranker.pairwise_accuracy(pairs),
            "Trained ranker"
        );
        Ok(ranker)
    }

    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }

    /// Share of pairs whose positive strictly outscores the negative
    pub fn pairwise_accuracy(&self, pairs: &[LabeledPair]) -> f32 {
        if pairs.is_empty() {
            return 0.0;
        }
        let correct = pairs
            .iter()
            .filter(|p| self.score(&p.positive) > self.score(&p.negative))
            .count();
        correct as f32 / pairs.len() as f32
    }
}

impl Ranker for PairwiseRanker {
    fn score(&self, features: &FeatureVector) -> f32 {
        self.weights.dot(&self.standardizer.transform(features))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn vector(price: Option<f32>, popularity: f32) -> FeatureVector {
        let mut values = [Some(1.0); NUM_FEATURES];
        values[0] = price;
        values[2] = Some(popularity);
        FeatureVector(values)
    }

    /// Positives are the more popular item; price is noise
    fn pairs(n: usize, seed: u64) -> Vec<LabeledPair> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| LabeledPair {
                receipt_id: i as i64,
                positive: vector(Some(rng.gen_range(1.0..10.0)), rng.gen_range(0.5..1.0)),
                negative: vector(Some(rng.gen_range(1.0..10.0)), rng.gen_range(0.0..0.5)),
            })
            .collect()
    }

    #[test]
    fn test_learns_separable_pairs() {
        let train = pairs(200, 1);
        let ranker = PairwiseRanker::fit(&train, &RankerConfig::default()).unwrap();

        assert!(ranker.pairwise_accuracy(&pairs(100, 2)) > 0.95);
        assert!(ranker.score(&vector(Some(5.0), 0.9)) > ranker.score(&vector(Some(5.0), 0.1)));
    }

    #[test]
    fn test_missing_values_use_indicator() {
        let mut train = pairs(100, 3);
        // Missing price only ever shows up on negatives.
        for pair in train.iter_mut().step_by(2) {
            pair.negative.0[0] = None;
        }
        let ranker = PairwiseRanker::fit(&train, &RankerConfig::default()).unwrap();

        let known = ranker.score(&vector(Some(5.5), 0.5));
        let missing = ranker.score(&vector(None, 0.5));
        assert!(missing.is_finite());
        assert!(missing < known);
        assert!(ranker.weights()[NUM_FEATURES] < 0.0);
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let train = pairs(50, 4);
        let config = RankerConfig::default();
        let a = PairwiseRanker::fit(&train, &config).unwrap();
        let b = PairwiseRanker::fit(&train, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_pairs_rejected() {
        assert!(matches!(
            PairwiseRanker::fit(&[], &RankerConfig::default()),
            Err(PipelineError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_standardizer_centres_present_values() {
        let vectors = [vector(Some(2.0), 0.0), vector(Some(4.0), 1.0), vector(None, 0.5)];
        let standardizer = Standardizer::fit(vectors.iter());

        let input = standardizer.transform(&vectors[0]);
        assert!((input[0] + 1.0).abs() < 1e-5);
        assert_eq!(input[NUM_FEATURES], 0.0);

        let input = standardizer.transform(&vectors[2]);
        assert_eq!(input[0], 0.0);
        assert_eq!(input[NUM_FEATURES], 1.0);
    }
}
