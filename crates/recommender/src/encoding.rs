//! Identifier encoding
//!
//! Bidirectional mapping between raw receipt/item identifiers and the dense
//! zero-based indices of the interaction matrices. Indices are assigned to the
//! unique raw values in ascending order, so rebuilding an encoder from the same
//! identifier universe always yields the same numbering.

use basket_recs_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Bijection between raw identifiers and `[0, len)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoder {
    name: String,
    raw_ids: Vec<i64>,
    #[serde(skip)]
    index: HashMap<i64, usize>,
}

impl Encoder {
    /// Enumerate the unique values of a column
    pub fn fit(name: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        let unique: BTreeSet<i64> = values.into_iter().collect();
        let raw_ids: Vec<i64> = unique.into_iter().collect();
        let index = raw_ids
            .iter()
            .enumerate()
            .map(|(idx, &raw)| (raw, idx))
            .collect();

        Self {
            name: name.into(),
            raw_ids,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.raw_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_ids.is_empty()
    }

    /// Index of a raw identifier, `None` when out of vocabulary
    pub fn encode(&self, raw: i64) -> Option<usize> {
        if self.index.len() == self.raw_ids.len() {
            self.index.get(&raw).copied()
        } else {
            // Lookup table is not serialized; fall back to the sorted ids.
            self.raw_ids.binary_search(&raw).ok()
        }
    }

    /// Raw identifier of an index
    ///
    /// Every index below `len()` has a raw value by construction, so a miss is
    /// a programming error and reported as such.
    pub fn decode(&self, index: usize) -> Result<i64> {
        self.raw_ids
            .get(index)
            .copied()
            .ok_or_else(|| PipelineError::UnknownIndex {
                encoder: self.name.clone(),
                index,
            })
    }

    /// Encode a table on one key column, excluding out-of-vocabulary rows
    pub fn encode_rows<'a, T, F>(&self, rows: &'a [T], key: F) -> Encoded<'a, T>
    where
        F: Fn(&T) -> i64,
    {
        let mut encoded = Vec::with_capacity(rows.len());
        let mut dropped = 0;
        for row in rows {
            match self.encode(key(row)) {
                Some(idx) => encoded.push((idx, row)),
                None => dropped += 1,
            }
        }
        Encoded {
            rows: encoded,
            dropped,
        }
    }

    /// Rebuild the lookup table after deserialization
    pub fn reindex(&mut self) {
        self.index = self
            .raw_ids
            .iter()
            .enumerate()
            .map(|(idx, &raw)| (raw, idx))
            .collect();
    }
}

/// Rows that survived encoding, with the number of excluded rows
#[derive(Debug)]
pub struct Encoded<'a, T> {
    pub rows: Vec<(usize, &'a T)>,
    pub dropped: usize,
}

/// Receipt and item encoders of one trained generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoders {
    pub receipt_id: Encoder,
    pub item_id: Encoder,
}

impl Encoders {
    pub fn reindex(&mut self) {
        self.receipt_id.reindex();
        self.item_id.reindex();
    }
}

/// Map raw receipt ids to matrix rows
///
/// Unknown receipts are skipped and will get no candidates. Repeated ids are
/// kept once, in order of first appearance.
pub fn receipt_indices(receipt_ids: &[i64], encoder: &Encoder) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut indices = Vec::with_capacity(receipt_ids.len());
    let mut unknown = 0usize;

    for &receipt_id in receipt_ids {
        match encoder.encode(receipt_id) {
            Some(idx) => {
                if seen.insert(idx) {
                    indices.push(idx);
                }
            }
            None => unknown += 1,
        }
    }

    if unknown > 0 {
        tracing::warn!(
            unknown,
            known = indices.len(),
            "Receipts absent from the trained encoder receive no candidates"
        );
    }

    indices
}
