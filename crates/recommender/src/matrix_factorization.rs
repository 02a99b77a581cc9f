//! Matrix Factorization using Alternating Least Squares (ALS)
//!
//! Implements ALS for implicit feedback (Hu, Koren, Volinsky). Decomposes the
//! raw receipt-item matrix into receipt and item latent factors.

use crate::models::{CandidateGenerator, UserRecommendations};
use crate::sparse::{SparseMatrix, SparseRow};
use crate::types::ModelKind;
use basket_recs_core::{AlsParams, PipelineError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Trained latent factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentFactors {
    /// [num_users x factors]
    pub user_factors: Array2<f32>,
    /// [num_items x factors]
    pub item_factors: Array2<f32>,
}

/// ALS-based matrix factorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixFactorization {
    params: AlsParams,
    factors: Option<LatentFactors>,
}

impl MatrixFactorization {
    pub fn new(params: AlsParams) -> Self {
        Self {
            params,
            factors: None,
        }
    }

    pub fn params(&self) -> &AlsParams {
        &self.params
    }

    pub fn factors(&self) -> Result<&LatentFactors> {
        self.factors
            .as_ref()
            .ok_or_else(|| PipelineError::ModelNotFitted(ModelKind::Als.to_string()))
    }

    /// Train on the raw interaction matrix
    pub fn fit(&mut self, matrix: &SparseMatrix) -> Result<()> {
        if self.factors.is_some() {
            return Err(PipelineError::ModelAlreadyFitted(ModelKind::Als.to_string()));
        }
        if matrix.nnz() == 0 {
            return Err(PipelineError::EmptyInput(
                "cannot factorize an empty matrix".to_string(),
            ));
        }

        let k = self.params.factors;
        let (num_users, num_items) = matrix.shape();
        let item_users = matrix.transpose();

        let mut rng = StdRng::seed_from_u64(self.params.random_state);
        let mut user_factors = Array2::<f32>::zeros((num_users, k));
        let mut item_factors = Array2::<f32>::zeros((num_items, k));
        for value in user_factors.iter_mut() {
            *value = rng.gen_range(-0.1..0.1);
        }
        for value in item_factors.iter_mut() {
            *value = rng.gen_range(-0.1..0.1);
        }

        for iteration in 0..self.params.iterations {
            self.solve_side(matrix, &item_factors, &mut user_factors)?;
            self.solve_side(&item_users, &user_factors, &mut item_factors)?;

            if iteration % 2 == 0 {
                let loss = self.compute_loss(matrix, &user_factors, &item_factors);
                tracing::debug!("ALS iteration {}: loss = {:.4}", iteration, loss);
            }
        }

        self.factors = Some(LatentFactors {
            user_factors,
            item_factors,
        });

        Ok(())
    }

    /// Confidence `alpha * |r|` and preference `r > 0` of one observed entry
    fn confidence(&self, value: f32) -> (f32, f32) {
        let confidence = self.params.alpha * value.abs();
        let preference = if value > 0.0 { 1.0 } else { 0.0 };
        (confidence, preference)
    }

    /// Recompute every row of `target` against the fixed `other` factors
    ///
    /// `interactions` has one row per target row, columns indexing `other`.
    fn solve_side(
        &self,
        interactions: &SparseMatrix,
        other: &Array2<f32>,
        target: &mut Array2<f32>,
    ) -> Result<()> {
        let k = self.params.factors;
        let lambda = self.params.regularization as f64;

        // Y^T Y is shared by every row.
        let gram = other.t().dot(other).mapv(|v| v as f64);

        for row in 0..interactions.num_rows() {
            let entries = interactions.row(row)?;
            if entries.nnz() == 0 {
                continue;
            }
            let x = self
                .solve_row(entries, other, &gram, lambda, k)
                .map_err(|e| PipelineError::Numerical(format!("ALS row {}: {}", row, e)))?;
            target.row_mut(row).assign(&x);
        }
        Ok(())
    }

    /// Solve `(Y^T C Y + lambda I) x = Y^T C p` for one row
    fn solve_row(
        &self,
        entries: SparseRow<'_>,
        other: &Array2<f32>,
        gram: &Array2<f64>,
        lambda: f64,
        k: usize,
    ) -> Result<Array1<f32>> {
        let mut a = gram.clone();
        let mut b = Array1::<f64>::zeros(k);

        for (idx, value) in entries.iter() {
            let vec = other.row(idx);
            let (confidence, preference) = self.confidence(value);

            // A += (c - 1) * y y^T
            let weight = (confidence - 1.0) as f64;
            if weight != 0.0 {
                for i in 0..k {
                    let yi = vec[i] as f64;
                    for j in 0..k {
                        a[[i, j]] += weight * yi * vec[j] as f64;
                    }
                }
            }

            // b += c * p * y
            if preference > 0.0 {
                for i in 0..k {
                    b[i] += (confidence * preference) as f64 * vec[i] as f64;
                }
            }
        }

        // Add regularization: A += lambda * I
        for i in 0..k {
            a[[i, i]] += lambda;
        }

        let x = Self::solve_least_squares(&a, &b)?;
        Ok(x.mapv(|v| v as f32))
    }

    /// Solve least squares system A * x = b using Cholesky decomposition
    /// For positive definite matrix A (which we guarantee by adding regularization)
    fn solve_least_squares(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
        let n = a.nrows();

        // Perform Cholesky decomposition: A = L * L^T
        let mut l = Array2::<f64>::zeros((n, n));

        for i in 0..n {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l[[i, k]] * l[[j, k]];
                }

                if i == j {
                    let diag = a[[i, i]] - sum;
                    if diag <= 0.0 {
                        return Err(PipelineError::Numerical(
                            "matrix is not positive definite".to_string(),
                        ));
                    }
                    l[[i, j]] = diag.sqrt();
                } else {
                    l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
                }
            }
        }

        // Forward substitution: L * y = b
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += l[[i, j]] * y[j];
            }
            y[i] = (b[i] - sum) / l[[i, i]];
        }

        // Backward substitution: L^T * x = y
        let mut x = Array1::<f64>::zeros(n);
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += l[[j, i]] * x[j];
            }
            x[i] = (y[i] - sum) / l[[i, i]];
        }

        Ok(x)
    }

    /// Confidence-weighted reconstruction loss over observed entries
    fn compute_loss(
        &self,
        matrix: &SparseMatrix,
        user_factors: &Array2<f32>,
        item_factors: &Array2<f32>,
    ) -> f32 {
        let mut loss = 0.0;
        let mut count = 0;

        for (u, i, value) in matrix.nonzeros() {
            let (confidence, preference) = self.confidence(value);
            let prediction = user_factors.row(u).dot(&item_factors.row(i));
            loss += confidence * (preference - prediction).powi(2);
            count += 1;
        }

        if count > 0 {
            loss / count as f32
        } else {
            0.0
        }
    }

    /// Predicted preference of a user for an item
    pub fn predict(&self, user_idx: usize, item_idx: usize) -> Result<f32> {
        let factors = self.factors()?;
        let user = factor_row(&factors.user_factors, user_idx)?;
        let item = factor_row(&factors.item_factors, item_idx)?;
        Ok(user.dot(&item))
    }

    /// Top `n` items per user by predicted preference
    ///
    /// Items the user already bought are not filtered out.
    pub fn recommend_users(&self, user_idxs: &[usize], n: usize) -> Result<Vec<UserRecommendations>> {
        let factors = self.factors()?;
        let num_items = factors.item_factors.nrows();
        let n = n.min(num_items);

        let mut output = Vec::with_capacity(user_idxs.len());
        for &user_idx in user_idxs {
            let user = factor_row(&factors.user_factors, user_idx)?;
            let scores = factors.item_factors.dot(&user);

            let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.truncate(n);

            output.push(UserRecommendations {
                user_idx,
                items: ranked,
            });
        }
        Ok(output)
    }
}

fn factor_row(factors: &Array2<f32>, idx: usize) -> Result<ArrayView1<'_, f32>> {
    if idx >= factors.nrows() {
        return Err(PipelineError::RowOutOfBounds {
            row: idx,
            rows: factors.nrows(),
        });
    }
    Ok(factors.row(idx))
}

impl CandidateGenerator for MatrixFactorization {
    fn kind(&self) -> ModelKind {
        ModelKind::Als
    }

    fn is_fitted(&self) -> bool {
        self.factors.is_some()
    }

    fn fit(&mut self, matrix: &SparseMatrix) -> Result<()> {
        MatrixFactorization::fit(self, matrix)
    }

    fn num_items(&self) -> Result<usize> {
        Ok(self.factors()?.item_factors.nrows())
    }

    fn recommend(
        &self,
        _user_items: &SparseMatrix,
        user_idxs: &[usize],
        n: usize,
    ) -> Result<Vec<UserRecommendations>> {
        self.recommend_users(user_idxs, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(factors: usize, iterations: usize) -> AlsParams {
        AlsParams {
            factors,
            regularization: 0.1,
            iterations,
            alpha: 1.0,
            random_state: 2105,
        }
    }

    fn toy_matrix() -> SparseMatrix {
        // Users 0 and 1 share item 0; user 2 buys items 2 and 3.
        SparseMatrix::from_triplets(
            3,
            4,
            vec![
                (0, 0, 2.0),
                (0, 1, 1.0),
                (1, 0, 1.0),
                (1, 1, 3.0),
                (2, 2, 1.0),
                (2, 3, 1.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_als_fit() {
        let mut mf = MatrixFactorization::new(params(4, 5));
        mf.fit(&toy_matrix()).unwrap();

        let factors = mf.factors().unwrap();
        assert_eq!(factors.user_factors.nrows(), 3);
        assert_eq!(factors.user_factors.ncols(), 4);
        assert_eq!(factors.item_factors.nrows(), 4);
        assert_eq!(factors.item_factors.ncols(), 4);
    }

    #[test]
    fn test_predict_prefers_observed_items() {
        let mut mf = MatrixFactorization::new(params(8, 15));
        mf.fit(&toy_matrix()).unwrap();

        let observed = mf.predict(0, 0).unwrap();
        let unrelated = mf.predict(0, 3).unwrap();
        assert!(observed > unrelated);
        assert!(observed > 0.0);
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let mut a = MatrixFactorization::new(params(4, 3));
        let mut b = MatrixFactorization::new(params(4, 3));
        a.fit(&toy_matrix()).unwrap();
        b.fit(&toy_matrix()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_recommend_keeps_purchased_items() {
        let mut mf = MatrixFactorization::new(params(8, 15));
        mf.fit(&toy_matrix()).unwrap();

        let recs = mf.recommend_users(&[2], 2).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].user_idx, 2);
        assert_eq!(recs[0].items.len(), 2);

        let items: Vec<usize> = recs[0].items.iter().map(|(i, _)| *i).collect();
        assert!(items.contains(&2) || items.contains(&3));
    }

    #[test]
    fn test_recommend_truncates_to_catalog() {
        let mut mf = MatrixFactorization::new(params(2, 2));
        mf.fit(&toy_matrix()).unwrap();

        let recs = mf.recommend_users(&[0, 1], 100).unwrap();
        assert!(recs.iter().all(|r| r.items.len() == 4));
    }

    #[test]
    fn test_recommend_before_fit_fails() {
        let mf = MatrixFactorization::new(params(2, 2));
        let err = mf.recommend_users(&[0], 1).unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotFitted(_)));
    }

    #[test]
    fn test_fit_twice_fails() {
        let mut mf = MatrixFactorization::new(params(2, 2));
        mf.fit(&toy_matrix()).unwrap();
        let err = mf.fit(&toy_matrix()).unwrap_err();
        assert!(matches!(err, PipelineError::ModelAlreadyFitted(_)));
    }

    #[test]
    fn test_unknown_user() {
        let mut mf = MatrixFactorization::new(params(2, 2));
        mf.fit(&toy_matrix()).unwrap();
        assert!(mf.predict(10, 0).is_err());
        assert!(mf.predict(0, 10).is_err());
    }

    #[test]
    fn test_confidence_scales_observed_value() {
        let mf = MatrixFactorization::new(AlsParams {
            alpha: 2.0,
            ..params(2, 1)
        });
        assert_eq!(mf.confidence(3.0), (6.0, 1.0));
        assert_eq!(mf.confidence(0.5), (1.0, 1.0));
        assert_eq!(mf.confidence(-1.0), (2.0, 0.0));
    }

    #[test]
    fn test_unit_confidence_adds_no_extra_weight() {
        // alpha = 1 and r = 1 give c = 1: A = Y^T Y + lambda I and b = y.
        let mf = MatrixFactorization::new(params(2, 1));
        let other = Array2::<f32>::eye(2);
        let gram = other.t().dot(&other).mapv(|v| v as f64);
        let matrix = SparseMatrix::from_triplets(1, 2, vec![(0, 0, 1.0)]).unwrap();

        let x = mf
            .solve_row(matrix.row(0).unwrap(), &other, &gram, 0.1, 2)
            .unwrap();
        assert!((x[0] - 1.0 / 1.1).abs() < 1e-6);
        assert!(x[1].abs() < 1e-6);
    }

    #[test]
    fn test_solve_least_squares_identity() {
        let a = Array2::<f64>::eye(3) * 2.0;
        let b = Array1::from(vec![2.0, 4.0, 6.0]);
        let x = MatrixFactorization::solve_least_squares(&a, &b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
        assert!((x[2] - 3.0).abs() < 1e-9);
    }
}
