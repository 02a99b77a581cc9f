//! Training pairs for the ranker
//!
//! Every multi-item receipt yields one pair: a uniformly drawn positive, the
//! rest of the basket as context, and a negative drawn from the popularity
//! distribution with rejection of anything already in the basket.

use crate::features::{basket_contexts, ContextFeatures, FeatureVector, ItemAggregates};
use crate::types::{ItemId, LineItem, ReceiptId};
use basket_recs_core::{PipelineError, Result, SamplingConfig};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// One sampled training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPair {
    pub receipt_id: ReceiptId,
    /// Basket without the positive
    pub context: Vec<ItemId>,
    pub positive: ItemId,
    pub negative: ItemId,
}

/// Feature vectors of a training pair, label 1 and label 0
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledPair {
    pub receipt_id: ReceiptId,
    pub positive: FeatureVector,
    pub negative: FeatureVector,
}

/// Popularity-weighted item sampler
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    items: Vec<ItemId>,
    distribution: WeightedIndex<f32>,
}

impl NegativeSampler {
    pub fn new(aggregates: &ItemAggregates) -> Result<Self> {
        let (items, weights): (Vec<ItemId>, Vec<f32>) = aggregates
            .popularity
            .iter()
            .filter(|(_, &w)| w.is_finite() && w > 0.0)
            .map(|(&item, &w)| (item, w))
            .unzip();

        let distribution = WeightedIndex::new(&weights).map_err(|e| {
            PipelineError::EmptyInput(format!("no item with positive popularity: {e}"))
        })?;

        Ok(Self {
            items,
            distribution,
        })
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Draw one item outside `basket`, giving up after `max_attempts` rejections
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        basket: &HashSet<ItemId>,
        receipt_id: ReceiptId,
        max_attempts: usize,
    ) -> Result<ItemId> {
        for _ in 0..max_attempts {
            let item = self.items[self.distribution.sample(rng)];
            if !basket.contains(&item) {
                return Ok(item);
            }
        }
        Err(PipelineError::NegativeSamplingExhausted {
            receipt_id,
            attempts: max_attempts,
        })
    }
}

/// Sample one pair per multi-item receipt of `train` followed by `val`
///
/// Receipts are visited in ascending id order, so a fixed seed reproduces the
/// same pairs.
pub fn build_training_pairs(
    train: &[LineItem],
    val: &[LineItem],
    aggregates: &ItemAggregates,
    config: &SamplingConfig,
) -> Result<Vec<TrainingPair>> {
    let lines: Vec<LineItem> = train.iter().chain(val.iter()).cloned().collect();
    let baskets = basket_contexts(&lines);
    let sampler = NegativeSampler::new(aggregates)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut pairs = Vec::new();
    let mut single_item = 0usize;

    for (receipt_id, basket) in baskets {
        if basket.len() < 2 {
            single_item += 1;
            continue;
        }

        let positive_at = rng.gen_range(0..basket.len());
        let positive = basket[positive_at];
        let members: HashSet<ItemId> = basket.iter().copied().collect();
        let negative = sampler.sample(&mut rng, &members, receipt_id, config.max_attempts)?;

        let context = basket
            .into_iter()
            .enumerate()
            .filter(|&(i, _)| i != positive_at)
            .map(|(_, item)| item)
            .collect();

        pairs.push(TrainingPair {
            receipt_id,
            context,
            positive,
            negative,
        });
    }

    debug!(single_item, "Skipped single-item receipts");
    info!(
        pairs = pairs.len(),
        catalog = sampler.num_items(),
        "Built training pairs"
    );

    Ok(pairs)
}

/// Features of both sides of every pair, against the pair's own context
pub fn join_training_features(pairs: &[TrainingPair], aggregates: &ItemAggregates) -> Vec<LabeledPair> {
    pairs
        .iter()
        .map(|pair| {
            let context = ContextFeatures::from_items(&pair.context, aggregates);
            LabeledPair {
                receipt_id: pair.receipt_id,
                positive: FeatureVector::new(pair.positive, &context, aggregates),
                negative: FeatureVector::new(pair.negative, &context, aggregates),
            }
        })
        .collect()
}
