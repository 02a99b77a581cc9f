//! Batched candidate inference
//!
//! Turns encoded receipt indices into per-model candidate tables. Similarity
//! models are scored block by block so the receipt x item product never covers
//! the whole population at once; ALS uses its own top-N routine.

use crate::encoding::{receipt_indices, Encoders};
use crate::interactions::InteractionMatrices;
use crate::models::{CandidateGenerator, RetrievalEnsemble, RetrievalModel};
use crate::sparse::SparseMatrix;
use crate::types::{Candidate, EncodedCandidate, ModelKind, ReceiptId};
use basket_recs_core::{InferenceConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Candidates of one inference batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub per_model: BTreeMap<ModelKind, Vec<Candidate>>,
    /// Deduplicated union of all models, in no particular order
    pub union: Vec<Candidate>,
}

/// Neighbour-model candidates, computed in blocks of `block_size` receipts
///
/// Each receipt keeps at most `min(n_candidates, num_items)` items with a
/// nonzero score.
pub fn nearest_neighbours_inference(
    model: &RetrievalModel,
    user_items: &SparseMatrix,
    user_idxs: &[usize],
    n_candidates: usize,
    block_size: usize,
) -> Result<Vec<EncodedCandidate>> {
    let n = n_candidates.min(model.num_items()?);
    let kind = model.kind();
    let mut candidates = Vec::new();

    for (block_no, block) in user_idxs.chunks(block_size.max(1)).enumerate() {
        let recommendations = model.recommend(user_items, block, n)?;
        for recs in recommendations {
            candidates.extend(recs.items.into_iter().map(|(item_idx, _)| EncodedCandidate {
                receipt_idx: recs.user_idx,
                item_idx,
                model_name: kind,
            }));
        }
        debug!(model = %kind, block = block_no, receipts = block.len(), "Scored block");
    }

    Ok(candidates)
}

/// ALS candidates straight from the factor model, already-bought items included
pub fn alternating_least_squares_inference(
    model: &RetrievalModel,
    user_items: &SparseMatrix,
    user_idxs: &[usize],
    n_candidates: usize,
) -> Result<Vec<EncodedCandidate>> {
    let n = n_candidates.min(model.num_items()?);
    let kind = model.kind();

    Ok(model
        .recommend(user_items, user_idxs, n)?
        .into_iter()
        .flat_map(|recs| {
            let receipt_idx = recs.user_idx;
            recs.items
                .into_iter()
                .map(move |(item_idx, _)| EncodedCandidate {
                    receipt_idx,
                    item_idx,
                    model_name: kind,
                })
        })
        .collect())
}

/// Candidates of every model in the ensemble, in encoded index space
pub fn get_candidates(
    models: &RetrievalEnsemble,
    normalized: &SparseMatrix,
    raw: &SparseMatrix,
    user_idxs: &[usize],
    config: &InferenceConfig,
) -> Result<BTreeMap<ModelKind, Vec<EncodedCandidate>>> {
    let mut tables = BTreeMap::new();

    for model in models.iter() {
        let candidates = match model {
            RetrievalModel::Bm25(_) | RetrievalModel::Tfidf(_) | RetrievalModel::Cosine(_) => {
                nearest_neighbours_inference(
                    model,
                    normalized,
                    user_idxs,
                    config.n_candidates,
                    config.block_size,
                )?
            }
            RetrievalModel::Als(_) => {
                alternating_least_squares_inference(model, raw, user_idxs, config.n_candidates)?
            }
        };

        info!(
            model = %model.kind(),
            receipts = user_idxs.len(),
            candidates = candidates.len(),
            "Generated candidates"
        );
        tables.insert(model.kind(), candidates);
    }

    Ok(tables)
}

/// Replace matrix indices with raw identifiers
///
/// Fails on an index without a raw value.
pub fn decode_candidates(table: &[EncodedCandidate], encoders: &Encoders) -> Result<Vec<Candidate>> {
    table
        .iter()
        .map(|c| {
            Ok(Candidate {
                receipt_id: encoders.receipt_id.decode(c.receipt_idx)?,
                item_id: encoders.item_id.decode(c.item_idx)?,
                model_name: c.model_name,
            })
        })
        .collect()
}

/// Concatenate candidate tables, dropping repeated `(receipt, item, model)`
///
/// Row order is unspecified.
pub fn union_candidates<'a, I>(tables: I) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a [Candidate]>,
{
    let mut seen: HashSet<Candidate> = HashSet::new();
    for table in tables {
        seen.extend(table.iter().copied());
    }
    seen.into_iter().collect()
}

/// Candidates for raw receipt ids against a trained generation
///
/// Receipts unknown to the encoders get no candidates.
pub fn inference_candidates(
    models: &RetrievalEnsemble,
    matrices: &InteractionMatrices,
    receipt_ids: &[ReceiptId],
    config: &InferenceConfig,
) -> Result<CandidateSet> {
    let user_idxs = receipt_indices(receipt_ids, &matrices.encoders.receipt_id);

    let encoded = get_candidates(
        models,
        &matrices.normalized,
        &matrices.raw,
        &user_idxs,
        config,
    )?;

    let mut per_model = BTreeMap::new();
    for (kind, table) in encoded {
        per_model.insert(kind, decode_candidates(&table, &matrices.encoders)?);
    }

    let union = union_candidates(per_model.values().map(|t| t.as_slice()));
    info!(
        receipts = user_idxs.len(),
        union = union.len(),
        "Built candidate union"
    );

    Ok(CandidateSet { per_model, union })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactions::{build_matrices, prepare_interactions};
    use crate::models::train_candidate_models;
    use crate::neighbours::{ItemKnnRecommender, Weighting};
    use crate::types::LineItem;
    use basket_recs_core::PipelineConfig;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn random_line_items(receipts: i64, items: i64, seed: u64) -> Vec<LineItem> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut lines = Vec::new();
        for receipt in 0..receipts {
            let basket = rng.gen_range(1..5);
            for _ in 0..basket {
                let item = rng.gen_range(0..items);
                lines.push(LineItem::new(receipt, item, rng.gen_range(1..4) as f32));
            }
        }
        lines
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.als.factors = 4;
        config.als.iterations = 3;
        config.inference.n_candidates = 5;
        config
    }

    #[test]
    fn test_truncation_matches_nonzero_scores() {
        let matrices = build_matrices(&prepare_interactions(&random_line_items(60, 25, 7))).unwrap();
        let config = small_config();
        let ensemble = train_candidate_models(&matrices, &config).unwrap();
        let users: Vec<usize> = (0..matrices.normalized.num_rows()).collect();

        for kind in [ModelKind::Bm25, ModelKind::Tfidf, ModelKind::Cosine] {
            let model = ensemble.get(kind).unwrap();
            let table = nearest_neighbours_inference(
                model,
                &matrices.normalized,
                &users,
                config.inference.n_candidates,
                7,
            )
            .unwrap();

            let mut counts: HashMap<usize, usize> = HashMap::new();
            for c in &table {
                *counts.entry(c.receipt_idx).or_insert(0) += 1;
            }

            let knn = match model {
                RetrievalModel::Bm25(m) | RetrievalModel::Tfidf(m) | RetrievalModel::Cosine(m) => m,
                RetrievalModel::Als(_) => unreachable!(),
            };
            let scores = knn.score(&matrices.normalized, &users).unwrap();
            for (row, &user) in users.iter().enumerate() {
                let nonzero = scores.nonzeros().filter(|&(r, _, _)| r == row).count();
                let expected = nonzero.min(config.inference.n_candidates);
                assert_eq!(counts.get(&user).copied().unwrap_or(0), expected);
            }
        }
    }

    #[test]
    fn test_block_size_does_not_change_results() {
        let matrices = build_matrices(&prepare_interactions(&random_line_items(45, 20, 11))).unwrap();
        let config = small_config();
        let ensemble = train_candidate_models(&matrices, &config).unwrap();
        let users: Vec<usize> = (0..matrices.normalized.num_rows()).rev().collect();

        for kind in [ModelKind::Bm25, ModelKind::Tfidf, ModelKind::Cosine] {
            let model = ensemble.get(kind).unwrap();
            let single =
                nearest_neighbours_inference(model, &matrices.normalized, &users, 5, 1000).unwrap();
            for block_size in [1, 4, 16] {
                let blocked = nearest_neighbours_inference(
                    model,
                    &matrices.normalized,
                    &users,
                    5,
                    block_size,
                )
                .unwrap();
                assert_eq!(single, blocked);
            }
        }
    }

    #[test]
    fn test_als_returns_n_per_receipt() {
        let matrices = build_matrices(&prepare_interactions(&random_line_items(30, 12, 3))).unwrap();
        let config = small_config();
        let ensemble = train_candidate_models(&matrices, &config).unwrap();
        let als = ensemble.get(ModelKind::Als).unwrap();

        let table = alternating_least_squares_inference(als, &matrices.raw, &[0, 1, 2], 5).unwrap();
        assert_eq!(table.len(), 15);
        assert!(table.iter().all(|c| c.model_name == ModelKind::Als));
    }

    #[test]
    fn test_known_similarity_top_two() {
        let similarity = SparseMatrix::from_triplets(
            3,
            3,
            vec![(0, 0, 1.0), (0, 1, 0.8), (0, 2, 0.3), (1, 2, 0.6)],
        )
        .unwrap();
        let model = RetrievalModel::Cosine(
            ItemKnnRecommender::with_similarity(Weighting::Cosine, similarity).unwrap(),
        );
        let user_items = SparseMatrix::from_triplets(1, 3, vec![(0, 0, 1.0)]).unwrap();

        let table = nearest_neighbours_inference(&model, &user_items, &[0], 2, 1000).unwrap();
        let items: Vec<usize> = table.iter().map(|c| c.item_idx).collect();
        assert_eq!(items, vec![0, 1]);
    }

    #[test]
    fn test_union_deduplicates() {
        let a = vec![
            Candidate { receipt_id: 1, item_id: 10, model_name: ModelKind::Bm25 },
            Candidate { receipt_id: 1, item_id: 20, model_name: ModelKind::Bm25 },
        ];
        let b = vec![
            Candidate { receipt_id: 1, item_id: 10, model_name: ModelKind::Bm25 },
            Candidate { receipt_id: 1, item_id: 10, model_name: ModelKind::Als },
        ];

        let union = union_candidates([a.as_slice(), b.as_slice()]);
        assert_eq!(union.len(), 3);
        assert!(union.len() <= a.len() + b.len());

        let distinct: HashSet<_> = union.iter().collect();
        assert_eq!(distinct.len(), union.len());
    }

    #[test]
    fn test_decode_unknown_index_fails() {
        let matrices = build_matrices(&prepare_interactions(&random_line_items(5, 5, 1))).unwrap();
        let bad = vec![EncodedCandidate {
            receipt_idx: 0,
            item_idx: 999,
            model_name: ModelKind::Cosine,
        }];
        assert!(decode_candidates(&bad, &matrices.encoders).is_err());
    }

    #[test]
    fn test_unknown_receipts_get_no_candidates() {
        let matrices = build_matrices(&prepare_interactions(&random_line_items(20, 10, 5))).unwrap();
        let config = small_config();
        let ensemble = train_candidate_models(&matrices, &config).unwrap();

        let set = inference_candidates(&ensemble, &matrices, &[0, 12345], &config.inference).unwrap();
        assert!(set.union.iter().all(|c| c.receipt_id == 0));
        assert!(!set.union.is_empty());
        assert_eq!(set.per_model.len(), 4);

        let none = inference_candidates(&ensemble, &matrices, &[12345], &config.inference).unwrap();
        assert!(none.union.is_empty());
    }
}
