//! Offline evaluation against held-out target items

use crate::candidates::CandidateSet;
use crate::types::{Candidate, ItemId, ReceiptId, Recommendation, Target};
use basket_recs_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

/// Top-1 accuracy of the final recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonMetrics {
    pub accuracy: f32,
    pub targets: usize,
    pub hits: usize,
    /// Targets whose receipt got no recommendation at all
    pub uncovered: usize,
}

/// Coverage of the target items by one candidate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecall {
    /// Share of targets whose item is among the receipt's candidates
    pub recall: f32,
    /// Mean number of distinct candidate items per target receipt
    pub mean_candidates: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetrics {
    pub targets: usize,
    pub per_model: BTreeMap<String, CandidateRecall>,
    pub union: CandidateRecall,
}

fn require_targets(targets: &[Target]) -> Result<()> {
    if targets.is_empty() {
        return Err(PipelineError::EmptyInput("no evaluation targets".to_string()));
    }
    Ok(())
}

/// Fraction of targets where the rank-1 recommendation is the target item
pub fn evaluate_common_metrics(
    targets: &[Target],
    recommendations: &[Recommendation],
) -> Result<CommonMetrics> {
    require_targets(targets)?;

    let top: HashMap<ReceiptId, ItemId> = recommendations
        .iter()
        .filter(|r| r.rank == 1)
        .map(|r| (r.receipt_id, r.item_id))
        .collect();

    let mut hits = 0;
    let mut uncovered = 0;
    for target in targets {
        match top.get(&target.receipt_id) {
            Some(&item_id) if item_id == target.item_id => hits += 1,
            Some(_) => {}
            None => uncovered += 1,
        }
    }

    let metrics = CommonMetrics {
        accuracy: hits as f32 / targets.len() as f32,
        targets: targets.len(),
        hits,
        uncovered,
    };
    info!(
        accuracy = metrics.accuracy,
        hits,
        uncovered,
        "Evaluated recommendations"
    );
    Ok(metrics)
}

fn candidate_recall(targets: &[Target], candidates: &[Candidate]) -> CandidateRecall {
    let mut baskets: HashMap<ReceiptId, HashSet<ItemId>> = HashMap::new();
    for c in candidates {
        baskets.entry(c.receipt_id).or_default().insert(c.item_id);
    }

    let mut found = 0usize;
    let mut total_candidates = 0usize;
    for target in targets {
        if let Some(items) = baskets.get(&target.receipt_id) {
            total_candidates += items.len();
            if items.contains(&target.item_id) {
                found += 1;
            }
        }
    }

    CandidateRecall {
        recall: found as f32 / targets.len() as f32,
        mean_candidates: total_candidates as f32 / targets.len() as f32,
    }
}

/// Recall of every model's candidates and of their union
pub fn evaluate_candidates_metrics(
    targets: &[Target],
    candidates: &CandidateSet,
) -> Result<CandidateMetrics> {
    require_targets(targets)?;

    let per_model: BTreeMap<String, CandidateRecall> = candidates
        .per_model
        .iter()
        .map(|(kind, table)| (kind.to_string(), candidate_recall(targets, table)))
        .collect();
    let union = candidate_recall(targets, &candidates.union);

    for (model, recall) in &per_model {
        info!(
            model = %model,
            recall = recall.recall,
            mean_candidates = recall.mean_candidates,
            "Candidate recall"
        );
    }
    info!(recall = union.recall, "Union candidate recall");

    Ok(CandidateMetrics {
        targets: targets.len(),
        per_model,
        union,
    })
}
