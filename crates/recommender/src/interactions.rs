//! Receipt-item interaction table and its sparse matrices
//!
//! Line items are aggregated per `(receipt, item)` into an interaction score
//! (summed quantity) and its per-receipt share. Both columns are then laid out
//! as CSR matrices over the same encoded index space.

use crate::encoding::{Encoder, Encoders};
use crate::sparse::SparseMatrix;
use crate::types::{ItemId, LineItem, ReceiptId};
use basket_recs_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Aggregated interaction of one item within one receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub interaction_score: f32,
    pub interaction_score_norm: f32,
}

/// Interaction table ("rpi")
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionTable {
    /// Sorted by receipt, then item
    pub records: Vec<InteractionRecord>,
    /// Receipts whose total score is zero; their shares are undefined
    pub dropped_receipts: Vec<ReceiptId>,
}

impl InteractionTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Interaction matrices with the encoders that index them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMatrices {
    /// `interaction_score_norm`, rows sum to one
    pub normalized: SparseMatrix,
    /// `interaction_score`
    pub raw: SparseMatrix,
    pub encoders: Encoders,
}

/// Aggregate line items into the interaction table
///
/// Pairs whose quantities are all missing have a null aggregate and are
/// dropped. Receipts with a zero (or non-finite) total are dropped as a whole
/// rather than filling the matrix with undefined shares.
pub fn prepare_interactions(line_items: &[LineItem]) -> InteractionTable {
    let mut aggregated: BTreeMap<(ReceiptId, ItemId), Option<f32>> = BTreeMap::new();

    for line in line_items {
        let entry = aggregated
            .entry((line.receipt_id, line.item_id))
            .or_insert(None);
        if let Some(quantity) = line.quantity {
            *entry = Some(entry.unwrap_or(0.0) + quantity);
        }
    }

    let mut denominators: BTreeMap<ReceiptId, f32> = BTreeMap::new();
    let mut scored = Vec::with_capacity(aggregated.len());
    let mut null_pairs = 0usize;

    for ((receipt_id, item_id), score) in aggregated {
        match score {
            Some(score) => {
                *denominators.entry(receipt_id).or_insert(0.0) += score;
                scored.push((receipt_id, item_id, score));
            }
            None => null_pairs += 1,
        }
    }

    let dropped_receipts: Vec<ReceiptId> = denominators
        .iter()
        .filter(|(_, &total)| total == 0.0 || !total.is_finite())
        .map(|(&receipt_id, _)| receipt_id)
        .collect();

    let records: Vec<InteractionRecord> = scored
        .into_iter()
        .filter_map(|(receipt_id, item_id, score)| {
            let total = denominators.get(&receipt_id).copied().unwrap_or(0.0);
            if total == 0.0 || !total.is_finite() {
                return None;
            }
            Some(InteractionRecord {
                receipt_id,
                item_id,
                interaction_score: score,
                interaction_score_norm: score / total,
            })
        })
        .collect();

    if null_pairs > 0 {
        warn!(null_pairs, "Dropped receipt-item pairs without any quantity");
    }
    if !dropped_receipts.is_empty() {
        warn!(
            receipts = dropped_receipts.len(),
            "Dropped receipts with zero total interaction score"
        );
    }

    info!(
        line_items = line_items.len(),
        interactions = records.len(),
        "Prepared interaction table"
    );

    InteractionTable {
        records,
        dropped_receipts,
    }
}

/// Encode the table and build the normalized and raw matrices
pub fn build_matrices(table: &InteractionTable) -> Result<InteractionMatrices> {
    if table.is_empty() {
        return Err(PipelineError::EmptyInput(
            "interaction table has no records".to_string(),
        ));
    }

    let encoders = Encoders {
        receipt_id: Encoder::fit("receipt_id", table.records.iter().map(|r| r.receipt_id)),
        item_id: Encoder::fit("item_id", table.records.iter().map(|r| r.item_id)),
    };

    let by_receipt = encoders
        .receipt_id
        .encode_rows(&table.records, |r| r.receipt_id);

    let mut normalized = Vec::with_capacity(table.len());
    let mut raw = Vec::with_capacity(table.len());
    let mut dropped = by_receipt.dropped;

    for (receipt_idx, record) in by_receipt.rows {
        match encoders.item_id.encode(record.item_id) {
            Some(item_idx) => {
                normalized.push((receipt_idx, item_idx, record.interaction_score_norm));
                raw.push((receipt_idx, item_idx, record.interaction_score));
            }
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!(dropped, "Excluded interactions with unknown identifiers");
    }

    let shape = (encoders.receipt_id.len(), encoders.item_id.len());
    let normalized = SparseMatrix::from_triplets(shape.0, shape.1, normalized)?;
    let raw = SparseMatrix::from_triplets(shape.0, shape.1, raw)?;

    info!(
        receipts = shape.0,
        items = shape.1,
        nnz = raw.nnz(),
        "Built interaction matrices"
    );

    Ok(InteractionMatrices {
        normalized,
        raw,
        encoders,
    })
}
