//! Item aggregates and the ranker feature join
//!
//! Aggregates are computed over the whole observed corpus. Joins are left
//! joins: an item without an aggregate keeps a missing value, which reaches the
//! ranker as missing rather than as zero.

use crate::types::{Candidate, ItemId, LineItem, ReceiptId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Row of the `prices` table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemPrice {
    pub item_id: ItemId,
    pub price: f32,
}

/// Row of the `quantities` table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemQuantity {
    pub item_id: ItemId,
    pub quantity: f32,
    pub popularity: f32,
}

/// Per-item aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemAggregates {
    /// Max observed price; items never seen with a price are absent
    pub prices: BTreeMap<ItemId, f32>,
    /// Summed quantity
    pub quantities: BTreeMap<ItemId, f32>,
    /// Receipt count divided by the largest receipt count
    pub popularity: BTreeMap<ItemId, f32>,
}

impl ItemAggregates {
    pub fn price(&self, item_id: ItemId) -> Option<f32> {
        self.prices.get(&item_id).copied()
    }

    pub fn quantity(&self, item_id: ItemId) -> Option<f32> {
        self.quantities.get(&item_id).copied()
    }

    pub fn popularity(&self, item_id: ItemId) -> Option<f32> {
        self.popularity.get(&item_id).copied()
    }

    pub fn num_items(&self) -> usize {
        self.popularity.len()
    }

    pub fn price_rows(&self) -> Vec<ItemPrice> {
        self.prices
            .iter()
            .map(|(&item_id, &price)| ItemPrice { item_id, price })
            .collect()
    }

    pub fn quantity_rows(&self) -> Vec<ItemQuantity> {
        self.quantities
            .iter()
            .map(|(&item_id, &quantity)| ItemQuantity {
                item_id,
                quantity,
                popularity: self.popularity.get(&item_id).copied().unwrap_or(0.0),
            })
            .collect()
    }

    /// Rebuild from the persisted tables
    pub fn from_rows(prices: &[ItemPrice], quantities: &[ItemQuantity]) -> Self {
        Self {
            prices: prices.iter().map(|r| (r.item_id, r.price)).collect(),
            quantities: quantities.iter().map(|r| (r.item_id, r.quantity)).collect(),
            popularity: quantities.iter().map(|r| (r.item_id, r.popularity)).collect(),
        }
    }
}

/// Max price, summed quantity and relative popularity per item
pub fn compute_item_aggregates(line_items: &[LineItem]) -> ItemAggregates {
    let mut prices: BTreeMap<ItemId, f32> = BTreeMap::new();
    let mut quantities: BTreeMap<ItemId, f32> = BTreeMap::new();
    let mut counts: BTreeMap<ItemId, usize> = BTreeMap::new();

    for line in line_items {
        if let Some(price) = line.price.filter(|p| p.is_finite()) {
            prices
                .entry(line.item_id)
                .and_modify(|max| *max = max.max(price))
                .or_insert(price);
        }
        let quantity = quantities.entry(line.item_id).or_insert(0.0);
        if let Some(q) = line.quantity {
            *quantity += q;
        }
        *counts.entry(line.item_id).or_insert(0) += 1;
    }

    // Every line-item row counts, repeated rows in one receipt included.
    let max_count = counts.values().copied().max().unwrap_or(0);
    let popularity = counts
        .into_iter()
        .map(|(item_id, count)| {
            let share = if max_count == 0 {
                0.0
            } else {
                count as f32 / max_count as f32
            };
            (item_id, share)
        })
        .collect();

    let aggregates = ItemAggregates {
        prices,
        quantities,
        popularity,
    };
    info!(
        items = aggregates.num_items(),
        priced = aggregates.prices.len(),
        "Computed item aggregates"
    );
    aggregates
}

/// Distinct items of every receipt, in first-seen order
pub fn basket_contexts(line_items: &[LineItem]) -> BTreeMap<ReceiptId, Vec<ItemId>> {
    let mut baskets: BTreeMap<ReceiptId, Vec<ItemId>> = BTreeMap::new();
    for line in line_items {
        let basket = baskets.entry(line.receipt_id).or_default();
        if !basket.contains(&line.item_id) {
            basket.push(line.item_id);
        }
    }
    baskets
}

/// Receipt-level aggregates of the context items
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextFeatures {
    pub size: f32,
    pub price_mean: Option<f32>,
    pub price_max: Option<f32>,
    pub price_min: Option<f32>,
    pub quantity_sum: Option<f32>,
    pub quantity_mean: Option<f32>,
    pub popularity_mean: Option<f32>,
}

impl ContextFeatures {
    /// Features of an empty (or unknown) context
    pub fn empty() -> Self {
        Self {
            size: 0.0,
            price_mean: None,
            price_max: None,
            price_min: None,
            quantity_sum: None,
            quantity_mean: None,
            popularity_mean: None,
        }
    }

    /// Aggregate the known values of `items`; a statistic with no known input is missing
    pub fn from_items(items: &[ItemId], aggregates: &ItemAggregates) -> Self {
        let prices: Vec<f32> = items.iter().filter_map(|&i| aggregates.price(i)).collect();
        let quantities: Vec<f32> = items.iter().filter_map(|&i| aggregates.quantity(i)).collect();
        let popularity: Vec<f32> = items
            .iter()
            .filter_map(|&i| aggregates.popularity(i))
            .collect();

        Self {
            size: items.len() as f32,
            price_mean: mean(&prices),
            price_max: prices.iter().copied().reduce(f32::max),
            price_min: prices.iter().copied().reduce(f32::min),
            quantity_sum: (!quantities.is_empty()).then(|| quantities.iter().sum()),
            quantity_mean: mean(&quantities),
            popularity_mean: mean(&popularity),
        }
    }
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// Slot names of [`FeatureVector`], in order
pub const FEATURE_NAMES: [&str; NUM_FEATURES] = [
    "candidate_price",
    "candidate_quantity",
    "candidate_popularity",
    "context_size",
    "context_price_mean",
    "context_price_max",
    "context_price_min",
    "context_quantity_sum",
    "context_quantity_mean",
    "context_popularity_mean",
];

pub const NUM_FEATURES: usize = 10;

/// Ranker input for one (context, candidate) pair; `None` marks a missing value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [Option<f32>; NUM_FEATURES]);

impl FeatureVector {
    pub fn new(candidate: ItemId, context: &ContextFeatures, aggregates: &ItemAggregates) -> Self {
        Self([
            aggregates.price(candidate),
            aggregates.quantity(candidate),
            aggregates.popularity(candidate),
            Some(context.size),
            context.price_mean,
            context.price_max,
            context.price_min,
            context.quantity_sum,
            context.quantity_mean,
            context.popularity_mean,
        ])
    }

    pub fn values(&self) -> &[Option<f32>; NUM_FEATURES] {
        &self.0
    }

    pub fn missing_count(&self) -> usize {
        self.0.iter().filter(|v| v.is_none()).count()
    }

    /// The candidate item had no aggregate at all
    pub fn candidate_unknown(&self) -> bool {
        self.0[..3].iter().all(Option::is_none)
    }
}

/// Context features for every receipt
pub fn join_context_features(
    contexts: &BTreeMap<ReceiptId, Vec<ItemId>>,
    aggregates: &ItemAggregates,
) -> BTreeMap<ReceiptId, ContextFeatures> {
    contexts
        .iter()
        .map(|(&receipt_id, items)| (receipt_id, ContextFeatures::from_items(items, aggregates)))
        .collect()
}

/// A distinct (receipt, candidate) pair with its features
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFeatures {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub features: FeatureVector,
}

/// Row of the `candidates_with_features` table, one column per feature slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateFeatureRow {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub candidate_price: Option<f32>,
    pub candidate_quantity: Option<f32>,
    pub candidate_popularity: Option<f32>,
    pub context_size: Option<f32>,
    pub context_price_mean: Option<f32>,
    pub context_price_max: Option<f32>,
    pub context_price_min: Option<f32>,
    pub context_quantity_sum: Option<f32>,
    pub context_quantity_mean: Option<f32>,
    pub context_popularity_mean: Option<f32>,
}

impl From<&CandidateFeatures> for CandidateFeatureRow {
    fn from(row: &CandidateFeatures) -> Self {
        let [
            candidate_price,
            candidate_quantity,
            candidate_popularity,
            context_size,
            context_price_mean,
            context_price_max,
            context_price_min,
            context_quantity_sum,
            context_quantity_mean,
            context_popularity_mean,
        ] = row.features.0;
        Self {
            receipt_id: row.receipt_id,
            item_id: row.item_id,
            candidate_price,
            candidate_quantity,
            candidate_popularity,
            context_size,
            context_price_mean,
            context_price_max,
            context_price_min,
            context_quantity_sum,
            context_quantity_mean,
            context_popularity_mean,
        }
    }
}

impl From<CandidateFeatureRow> for CandidateFeatures {
    fn from(row: CandidateFeatureRow) -> Self {
        Self {
            receipt_id: row.receipt_id,
            item_id: row.item_id,
            features: FeatureVector([
                row.candidate_price,
                row.candidate_quantity,
                row.candidate_popularity,
                row.context_size,
                row.context_price_mean,
                row.context_price_max,
                row.context_price_min,
                row.context_quantity_sum,
                row.context_quantity_mean,
                row.context_popularity_mean,
            ]),
        }
    }
}

/// Join context and item features onto the candidates
///
/// Candidates proposed by several models appear once. Rows come out sorted by
/// receipt, then item.
pub fn join_candidates_features(
    candidates: &[Candidate],
    contexts: &BTreeMap<ReceiptId, ContextFeatures>,
    aggregates: &ItemAggregates,
) -> Vec<CandidateFeatures> {
    let pairs: BTreeSet<(ReceiptId, ItemId)> = candidates
        .iter()
        .map(|c| (c.receipt_id, c.item_id))
        .collect();

    let empty = ContextFeatures::empty();
    let mut missing_context = 0usize;
    let mut unknown_items = 0usize;

    let rows: Vec<CandidateFeatures> = pairs
        .into_iter()
        .map(|(receipt_id, item_id)| {
            let context = contexts.get(&receipt_id).unwrap_or_else(|| {
                missing_context += 1;
                &empty
            });
            let features = FeatureVector::new(item_id, context, aggregates);
            if features.candidate_unknown() {
                unknown_items += 1;
            }
            CandidateFeatures {
                receipt_id,
                item_id,
                features,
            }
        })
        .collect();

    if missing_context > 0 {
        warn!(
            rows = missing_context,
            "Candidates without a receipt context"
        );
    }
    if unknown_items > 0 {
        warn!(
            rows = unknown_items,
            "Candidates without item aggregates, features left missing"
        );
    }
    info!(rows = rows.len(), "Joined candidate features");

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelKind;

    fn corpus() -> Vec<LineItem> {
        vec![
            LineItem::new(1, 10, 1.0).with_price(2.0),
            LineItem::new(1, 20, 2.0).with_price(5.0),
            LineItem::new(2, 10, 3.0).with_price(3.0),
            LineItem::new(2, 30, 1.0),
            LineItem::new(3, 10, 1.0).with_price(1.0),
        ]
    }

    #[test]
    fn test_item_aggregates() {
        let agg = compute_item_aggregates(&corpus());

        assert_eq!(agg.price(10), Some(3.0));
        assert_eq!(agg.price(30), None);
        assert_eq!(agg.quantity(10), Some(5.0));
        assert_eq!(agg.popularity(10), Some(1.0));
        assert!((agg.popularity(20).unwrap() - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(agg.popularity(99), None);
    }

    #[test]
    fn test_popularity_counts_repeated_rows() {
        let lines = vec![
            LineItem::new(1, 10, 1.0),
            LineItem::new(1, 10, 2.0),
            LineItem::new(1, 20, 1.0),
            LineItem::new(2, 20, 1.0),
            LineItem::new(3, 30, 1.0),
        ];
        let agg = compute_item_aggregates(&lines);

        // Items 10 and 20 both have two rows, though 10 sits in one receipt.
        assert_eq!(agg.popularity(10), Some(1.0));
        assert_eq!(agg.popularity(20), Some(1.0));
        assert_eq!(agg.popularity(30), Some(0.5));
    }

    #[test]
    fn test_rows_round_trip() {
        let agg = compute_item_aggregates(&corpus());
        let rebuilt = ItemAggregates::from_rows(&agg.price_rows(), &agg.quantity_rows());
        assert_eq!(rebuilt, agg);
    }

    #[test]
    fn test_context_features_skip_missing() {
        let agg = compute_item_aggregates(&corpus());
        let ctx = ContextFeatures::from_items(&[20, 30], &agg);

        assert_eq!(ctx.size, 2.0);
        assert_eq!(ctx.price_mean, Some(5.0));
        assert_eq!(ctx.price_min, Some(5.0));
        assert_eq!(ctx.quantity_sum, Some(3.0));

        let unknown = ContextFeatures::from_items(&[99], &agg);
        assert_eq!(unknown.size, 1.0);
        assert_eq!(unknown.price_mean, None);
        assert_eq!(unknown.popularity_mean, None);
    }

    #[test]
    fn test_unknown_candidate_propagates_missing() {
        let agg = compute_item_aggregates(&corpus());
        let contexts = join_context_features(&basket_contexts(&corpus()), &agg);
        let candidates = vec![
            Candidate { receipt_id: 1, item_id: 99, model_name: ModelKind::Bm25 },
            Candidate { receipt_id: 1, item_id: 99, model_name: ModelKind::Als },
            Candidate { receipt_id: 1, item_id: 30, model_name: ModelKind::Als },
        ];

        let rows = join_candidates_features(&candidates, &contexts, &agg);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].item_id, 30);
        assert_eq!(rows[0].features.values()[0], None);
        assert_eq!(rows[0].features.values()[1], Some(1.0));

        let unknown = &rows[1];
        assert!(unknown.features.candidate_unknown());
        assert_eq!(unknown.features.values()[3], Some(2.0));
        assert!(unknown.features.values()[4].is_some());
    }

    #[test]
    fn test_basket_contexts_are_distinct() {
        let lines = vec![
            LineItem::new(1, 10, 1.0),
            LineItem::new(1, 10, 1.0),
            LineItem::new(1, 20, 1.0),
        ];
        assert_eq!(basket_contexts(&lines)[&1], vec![10, 20]);
    }
}
