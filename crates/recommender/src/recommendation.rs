//! Candidate scoring and final selection
//!
//! Every candidate is scored independently against its receipt's context; the
//! best `k` per receipt become the recommendations. Equal scores are broken by
//! the lower item id.

use crate::features::{
    basket_contexts, join_candidates_features, join_context_features, CandidateFeatures,
    ItemAggregates,
};
use crate::ranker::Ranker;
use crate::types::{Candidate, ItemId, LineItem, ReceiptId, Recommendation};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::info;

/// A candidate with its ranker score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub score: f32,
}

pub fn score_candidates(rows: &[CandidateFeatures], ranker: &dyn Ranker) -> Vec<ScoredCandidate> {
    rows.iter()
        .map(|row| ScoredCandidate {
            receipt_id: row.receipt_id,
            item_id: row.item_id,
            score: ranker.score(&row.features),
        })
        .collect()
}

/// Best first; NaN sorts last, ties go to the lower item id
fn by_score_then_item(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    key(b.score)
        .total_cmp(&key(a.score))
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Up to `k` best candidates per receipt, ranked from 1
pub fn select_top_k(scored: &[ScoredCandidate], k: usize) -> Vec<Recommendation> {
    let mut by_receipt: BTreeMap<ReceiptId, Vec<ScoredCandidate>> = BTreeMap::new();
    for candidate in scored {
        by_receipt
            .entry(candidate.receipt_id)
            .or_default()
            .push(*candidate);
    }

    let mut recommendations = Vec::new();
    for (receipt_id, mut candidates) in by_receipt {
        candidates.sort_by(by_score_then_item);
        recommendations.extend(candidates.into_iter().take(k).enumerate().map(|(i, c)| {
            Recommendation {
                receipt_id,
                item_id: c.item_id,
                score: c.score,
                rank: i + 1,
            }
        }));
    }
    recommendations
}

/// The single best candidate per receipt
pub fn select_top(scored: &[ScoredCandidate]) -> Vec<Recommendation> {
    select_top_k(scored, 1)
}

/// Rank the candidates of every receipt against its context basket
///
/// `context` holds the line items of the receipts being recommended for.
pub fn recommend(
    candidates: &[Candidate],
    context: &[LineItem],
    aggregates: &ItemAggregates,
    ranker: &dyn Ranker,
    k: usize,
) -> Vec<Recommendation> {
    let rows = candidates_with_features(candidates, context, aggregates);
    rank_candidate_features(&rows, ranker, k)
}

/// Candidates joined with the context features of their receipt basket
pub fn candidates_with_features(
    candidates: &[Candidate],
    context: &[LineItem],
    aggregates: &ItemAggregates,
) -> Vec<CandidateFeatures> {
    let contexts = join_context_features(&basket_contexts(context), aggregates);
    join_candidates_features(candidates, &contexts, aggregates)
}

/// Score already joined candidate rows and keep the best `k` per receipt
pub fn rank_candidate_features(
    rows: &[CandidateFeatures],
    ranker: &dyn Ranker,
    k: usize,
) -> Vec<Recommendation> {
    let scored = score_candidates(rows, ranker);
    let recommendations = select_top_k(&scored, k);

    info!(
        candidates = rows.len(),
        recommendations = recommendations.len(),
        k,
        "Selected recommendations"
    );
    recommendations
}
