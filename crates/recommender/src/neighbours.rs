//! Item-item nearest neighbour recommenders
//!
//! The three similarity models share one procedure: weight the item-receipt
//! matrix (items are documents, receipts are terms), take the dot products of
//! the weighted item rows and keep the `K` strongest neighbours of every item.
//! They differ only in the weighting.

use crate::models::{CandidateGenerator, UserRecommendations};
use crate::sparse::SparseMatrix;
use crate::types::ModelKind;
use basket_recs_core::{Bm25Params, CosineParams, PipelineError, Result, TfidfParams};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Weighting of the item vectors before the item-item product
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Weighting {
    /// Okapi BM25 with term saturation `k1` and item length normalisation `b`
    Bm25 { k1: f32, b: f32 },
    /// `sqrt(tf) * idf`, then unit L2 norm per item
    Tfidf,
    /// Unit L2 norm per item
    Cosine,
}

impl Weighting {
    pub fn kind(&self) -> ModelKind {
        match self {
            Weighting::Bm25 { .. } => ModelKind::Bm25,
            Weighting::Tfidf => ModelKind::Tfidf,
            Weighting::Cosine => ModelKind::Cosine,
        }
    }

    /// Weighted item vectors, `[num_items x num_receipts]`, of a receipt-item matrix
    pub fn item_vectors(&self, user_items: &SparseMatrix) -> SparseMatrix {
        let item_users = user_items.transpose();
        match *self {
            Weighting::Bm25 { k1, b } => {
                let idf = inverse_document_frequency(&item_users);
                let lengths = item_users.row_sums();
                let average = if lengths.is_empty() {
                    0.0
                } else {
                    lengths.iter().sum::<f32>() / lengths.len() as f32
                };
                item_users.map_entries(|item, receipt, value| {
                    let length_norm = if average != 0.0 {
                        (1.0 - b) + b * lengths[item] / average
                    } else {
                        1.0
                    };
                    let denominator = k1 * length_norm + value;
                    if denominator == 0.0 {
                        0.0
                    } else {
                        value * (k1 + 1.0) / denominator * idf[receipt]
                    }
                })
            }
            Weighting::Tfidf => {
                let idf = inverse_document_frequency(&item_users);
                // Negative quantities (returns) keep their sign.
                let weighted = item_users.map_entries(|_, receipt, value| {
                    value.signum() * value.abs().sqrt() * idf[receipt]
                });
                normalize_rows(&weighted)
            }
            Weighting::Cosine => normalize_rows(&item_users),
        }
    }
}

/// `ln(N) - ln(1 + df)` per receipt, `N` the number of items and `df` the
/// number of items in the receipt
fn inverse_document_frequency(item_users: &SparseMatrix) -> Vec<f32> {
    let n = item_users.num_rows().max(1) as f32;
    item_users
        .column_counts()
        .into_iter()
        .map(|df| n.ln() - (df as f32).ln_1p())
        .collect()
}

/// Scale every row to unit L2 norm; all-zero rows stay zero
fn normalize_rows(matrix: &SparseMatrix) -> SparseMatrix {
    let mut norms = vec![0.0f32; matrix.num_rows()];
    for (row, _, value) in matrix.nonzeros() {
        norms[row] += value * value;
    }
    for norm in norms.iter_mut() {
        *norm = norm.sqrt();
    }
    matrix.map_entries(|row, _, value| {
        if norms[row] > 0.0 {
            value / norms[row]
        } else {
            0.0
        }
    })
}

/// Item-item neighbour model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemKnnRecommender {
    weighting: Weighting,
    /// Neighbours kept per item
    k: usize,
    similarity: Option<SparseMatrix>,
}

impl ItemKnnRecommender {
    pub fn new(weighting: Weighting, k: usize) -> Self {
        Self {
            weighting,
            k,
            similarity: None,
        }
    }

    pub fn bm25(params: &Bm25Params) -> Self {
        Self::new(
            Weighting::Bm25 {
                k1: params.k1,
                b: params.b,
            },
            params.k,
        )
    }

    pub fn tfidf(params: &TfidfParams) -> Self {
        Self::new(Weighting::Tfidf, params.k)
    }

    pub fn cosine(params: &CosineParams) -> Self {
        Self::new(Weighting::Cosine, params.k)
    }

    /// Build from an already computed item-item matrix
    pub fn with_similarity(weighting: Weighting, similarity: SparseMatrix) -> Result<Self> {
        let (rows, cols) = similarity.shape();
        if rows != cols {
            return Err(PipelineError::ShapeMismatch {
                operation: "item-item similarity".to_string(),
                left: (rows, cols),
                right: (cols, rows),
            });
        }
        Ok(Self {
            weighting,
            k: cols,
            similarity: Some(similarity),
        })
    }

    pub fn weighting(&self) -> Weighting {
        self.weighting
    }

    /// Trained item-item similarity, `[num_items x num_items]`
    pub fn similarity(&self) -> Result<&SparseMatrix> {
        self.similarity
            .as_ref()
            .ok_or_else(|| PipelineError::ModelNotFitted(self.weighting.kind().to_string()))
    }

    pub fn fit(&mut self, user_items: &SparseMatrix) -> Result<()> {
        let kind = self.weighting.kind();
        if self.similarity.is_some() {
            return Err(PipelineError::ModelAlreadyFitted(kind.to_string()));
        }

        let items = self.weighting.item_vectors(user_items);
        let similarity = items.matmul(&items.transpose())?.top_k_per_row(self.k);

        info!(
            model = %kind,
            items = similarity.num_rows(),
            nnz = similarity.nnz(),
            "Fitted item-item similarity"
        );

        self.similarity = Some(similarity);
        Ok(())
    }

    /// Score every item for the given receipts
    ///
    /// Row `i` of the result belongs to `user_idxs[i]`.
    pub fn score(&self, user_items: &SparseMatrix, user_idxs: &[usize]) -> Result<SparseMatrix> {
        let similarity = self.similarity()?;
        user_items.select_rows(user_idxs)?.matmul(similarity)
    }
}

/// Rank the nonzero scores of one row, best first, truncated to `n`
///
/// The sort is stable over ascending item index, so equal scores keep their
/// original order.
pub fn rank_row(scores: &SparseMatrix, row: usize, n: usize) -> Result<Vec<(usize, f32)>> {
    let mut ranked: Vec<(usize, f32)> = scores.row(row)?.iter().filter(|&(_, s)| s != 0.0).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(n);
    Ok(ranked)
}

impl CandidateGenerator for ItemKnnRecommender {
    fn kind(&self) -> ModelKind {
        self.weighting.kind()
    }

    fn is_fitted(&self) -> bool {
        self.similarity.is_some()
    }

    fn fit(&mut self, matrix: &SparseMatrix) -> Result<()> {
        ItemKnnRecommender::fit(self, matrix)
    }

    fn num_items(&self) -> Result<usize> {
        Ok(self.similarity()?.num_cols())
    }

    fn recommend(
        &self,
        user_items: &SparseMatrix,
        user_idxs: &[usize],
        n: usize,
    ) -> Result<Vec<UserRecommendations>> {
        let n = n.min(self.num_items()?);
        let scores = self.score(user_items, user_idxs)?;

        user_idxs
            .iter()
            .enumerate()
            .map(|(row, &user_idx)| {
                Ok(UserRecommendations {
                    user_idx,
                    items: rank_row(&scores, row, n)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_normalized() -> SparseMatrix {
        SparseMatrix::from_triplets(
            3,
            4,
            vec![
                (0, 0, 0.5),
                (0, 1, 0.5),
                (1, 1, 0.25),
                (1, 2, 0.75),
                (2, 3, 1.0),
            ],
        )
        .unwrap()
    }

    /// Receipts {A, B}, {A, C} and {D} over items A=0, B=1, C=2, D=3
    fn four_items() -> SparseMatrix {
        SparseMatrix::from_triplets(
            3,
            4,
            vec![(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (1, 2, 1.0), (2, 3, 1.0)],
        )
        .unwrap()
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-5,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_cosine_weighting_normalizes_items() {
        let items = Weighting::Cosine.item_vectors(&toy_normalized());
        assert_eq!(items.shape(), (4, 3));
        for item in 0..4 {
            let norm: f32 = items
                .row(item)
                .unwrap()
                .values
                .iter()
                .map(|v| v * v)
                .sum();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cosine_self_similarity_is_one() {
        let mut model = ItemKnnRecommender::cosine(&CosineParams { k: 4 });
        model.fit(&toy_normalized()).unwrap();
        let sim = model.similarity().unwrap();
        assert_eq!(sim.shape(), (4, 4));
        for item in 0..4 {
            assert!((sim.get(item, item) - 1.0).abs() < 1e-5);
        }
        // Items 0 and 3 never co-occur.
        assert_eq!(sim.get(0, 3), 0.0);
        assert!(sim.get(0, 1) > 0.0);
    }

    #[test]
    fn test_k_limits_neighbours() {
        let mut model = ItemKnnRecommender::tfidf(&TfidfParams { k: 1 });
        model.fit(&toy_normalized()).unwrap();
        let sim = model.similarity().unwrap();
        for item in 0..4 {
            assert!(sim.row(item).unwrap().nnz() <= 1);
        }
    }

    #[test]
    fn test_idf_is_taken_over_receipts() {
        let idf = inverse_document_frequency(&four_items().transpose());
        assert_eq!(idf.len(), 3);
        // Four items; receipts 0 and 1 hold two items, receipt 2 holds one.
        assert_close(idf[0], 4.0f32.ln() - 3.0f32.ln());
        assert_close(idf[1], 4.0f32.ln() - 3.0f32.ln());
        assert_close(idf[2], 4.0f32.ln() - 2.0f32.ln());
    }

    #[test]
    fn test_tfidf_similarity_values() {
        let mut model = ItemKnnRecommender::tfidf(&TfidfParams { k: 4 });
        model.fit(&four_items()).unwrap();
        let sim = model.similarity().unwrap();

        // A = [1, 1, 0] / sqrt(2) after scaling by the equal receipt idf.
        let inv_sqrt2 = std::f32::consts::FRAC_1_SQRT_2;
        assert_close(sim.get(0, 0), 1.0);
        assert_close(sim.get(0, 1), inv_sqrt2);
        assert_close(sim.get(0, 2), inv_sqrt2);
        assert_close(sim.get(1, 0), inv_sqrt2);
        assert_close(sim.get(3, 3), 1.0);
        assert_eq!(sim.get(1, 2), 0.0);
        assert_eq!(sim.get(0, 3), 0.0);
    }

    #[test]
    fn test_bm25_without_length_norm_uses_receipt_idf() {
        let mut model = ItemKnnRecommender::bm25(&Bm25Params {
            k1: 1.2,
            b: 0.0,
            ..Bm25Params::default()
        });
        model.fit(&four_items()).unwrap();
        let sim = model.similarity().unwrap();

        // With b = 0 and tf = 1 every weight equals the idf of its receipt.
        let shared = 4.0f32.ln() - 3.0f32.ln();
        let single = 2.0f32.ln();
        assert_close(sim.get(0, 0), 2.0 * shared * shared);
        assert_close(sim.get(0, 1), shared * shared);
        assert_close(sim.get(3, 3), single * single);
    }

    #[test]
    fn test_bm25_similarity_values() {
        let mut model = ItemKnnRecommender::bm25(&Bm25Params {
            k1: 1.2,
            b: 0.75,
            ..Bm25Params::default()
        });
        model.fit(&four_items()).unwrap();
        let sim = model.similarity().unwrap();

        // Item lengths A=2, B=C=D=1, average 1.25.
        let shared = 4.0f32.ln() - 3.0f32.ln();
        let a = 2.2 / (1.2 * 1.45 + 1.0) * shared;
        let b = 2.2 / (1.2 * 0.85 + 1.0) * shared;
        let d = 2.2 / (1.2 * 0.85 + 1.0) * 2.0f32.ln();
        assert_close(sim.get(0, 0), 2.0 * a * a);
        assert_close(sim.get(0, 1), a * b);
        assert_close(sim.get(0, 1), 0.072_371_74);
        assert_close(sim.get(3, 3), d * d);
        assert_eq!(sim.get(1, 2), 0.0);
    }

    #[test]
    fn test_bm25_fits() {
        let mut model = ItemKnnRecommender::bm25(&Bm25Params::default());
        model.fit(&toy_normalized()).unwrap();
        assert!(model.is_fitted());
        assert_eq!(model.kind(), ModelKind::Bm25);
    }

    #[test]
    fn test_recommend_with_known_similarity() {
        // Known similarity: item 0 -> (1: 0.9, 2: 0.4), item 1 -> (2: 0.7)
        let similarity = SparseMatrix::from_triplets(
            4,
            4,
            vec![(0, 1, 0.9), (0, 2, 0.4), (1, 2, 0.7), (3, 3, 1.0)],
        )
        .unwrap();
        let model = ItemKnnRecommender::with_similarity(Weighting::Cosine, similarity).unwrap();

        // Receipt buys items 0 and 1 equally: scores 1 -> 0.45, 2 -> 0.55
        let user_items =
            SparseMatrix::from_triplets(1, 4, vec![(0, 0, 0.5), (0, 1, 0.5)]).unwrap();
        let recs = model.recommend(&user_items, &[0], 2).unwrap();

        assert_eq!(recs.len(), 1);
        let items: Vec<usize> = recs[0].items.iter().map(|(i, _)| *i).collect();
        assert_eq!(items, vec![2, 1]);
        assert!((recs[0].items[0].1 - 0.55).abs() < 1e-6);
        assert!((recs[0].items[1].1 - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_rank_row_ties_keep_index_order() {
        let scores =
            SparseMatrix::from_triplets(1, 4, vec![(0, 3, 1.0), (0, 1, 1.0), (0, 2, 2.0)])
                .unwrap();
        let ranked = rank_row(&scores, 0, 3).unwrap();
        let items: Vec<usize> = ranked.iter().map(|(i, _)| *i).collect();
        assert_eq!(items, vec![2, 1, 3]);
    }

    #[test]
    fn test_recommend_before_fit() {
        let model = ItemKnnRecommender::cosine(&CosineParams::default());
        let user_items = toy_normalized();
        assert!(matches!(
            model.recommend(&user_items, &[0], 5),
            Err(PipelineError::ModelNotFitted(_))
        ));
    }

    #[test]
    fn test_fit_twice() {
        let mut model = ItemKnnRecommender::cosine(&CosineParams::default());
        model.fit(&toy_normalized()).unwrap();
        assert!(matches!(
            model.fit(&toy_normalized()),
            Err(PipelineError::ModelAlreadyFitted(_))
        ));
    }
}
