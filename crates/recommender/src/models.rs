//! Retrieval model ensemble
//!
//! Four independently trained candidate generators over the same interaction
//! matrices: BM25, TF-IDF and cosine item-item neighbours (normalized matrix)
//! and ALS (raw matrix).

use crate::interactions::InteractionMatrices;
use crate::matrix_factorization::MatrixFactorization;
use crate::neighbours::ItemKnnRecommender;
use crate::sparse::SparseMatrix;
use crate::types::ModelKind;
use basket_recs_core::{PipelineConfig, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Ranked items for one receipt, best first
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecommendations {
    pub user_idx: usize,
    pub items: Vec<(usize, f32)>,
}

/// Fit/recommend contract shared by every retrieval model
///
/// `fit` may be called once; `recommend` only after `fit`. Both violations are
/// reported as errors, never retried.
pub trait CandidateGenerator {
    fn kind(&self) -> ModelKind;

    fn is_fitted(&self) -> bool;

    fn fit(&mut self, matrix: &SparseMatrix) -> Result<()>;

    /// Number of items the trained model can score
    fn num_items(&self) -> Result<usize>;

    /// Top `n` items for each of `user_idxs`
    fn recommend(
        &self,
        user_items: &SparseMatrix,
        user_idxs: &[usize],
        n: usize,
    ) -> Result<Vec<UserRecommendations>>;
}

/// One member of the ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetrievalModel {
    Bm25(ItemKnnRecommender),
    Tfidf(ItemKnnRecommender),
    Cosine(ItemKnnRecommender),
    Als(MatrixFactorization),
}

impl RetrievalModel {
    /// Untrained model of the given kind, parameterised from the config
    pub fn from_config(kind: ModelKind, config: &PipelineConfig) -> Self {
        match kind {
            ModelKind::Bm25 => RetrievalModel::Bm25(ItemKnnRecommender::bm25(&config.bm25)),
            ModelKind::Tfidf => RetrievalModel::Tfidf(ItemKnnRecommender::tfidf(&config.tfidf)),
            ModelKind::Cosine => {
                RetrievalModel::Cosine(ItemKnnRecommender::cosine(&config.cosine))
            }
            ModelKind::Als => RetrievalModel::Als(MatrixFactorization::new(config.als.clone())),
        }
    }

    fn generator(&self) -> &dyn CandidateGenerator {
        match self {
            RetrievalModel::Bm25(m) | RetrievalModel::Tfidf(m) | RetrievalModel::Cosine(m) => m,
            RetrievalModel::Als(m) => m,
        }
    }

    fn generator_mut(&mut self) -> &mut dyn CandidateGenerator {
        match self {
            RetrievalModel::Bm25(m) | RetrievalModel::Tfidf(m) | RetrievalModel::Cosine(m) => m,
            RetrievalModel::Als(m) => m,
        }
    }

    /// The interaction matrix this model trains and scores on
    pub fn matrix<'a>(&self, matrices: &'a InteractionMatrices) -> &'a SparseMatrix {
        if self.kind().uses_normalized_matrix() {
            &matrices.normalized
        } else {
            &matrices.raw
        }
    }
}

impl CandidateGenerator for RetrievalModel {
    fn kind(&self) -> ModelKind {
        match self {
            RetrievalModel::Bm25(_) => ModelKind::Bm25,
            RetrievalModel::Tfidf(_) => ModelKind::Tfidf,
            RetrievalModel::Cosine(_) => ModelKind::Cosine,
            RetrievalModel::Als(_) => ModelKind::Als,
        }
    }

    fn is_fitted(&self) -> bool {
        self.generator().is_fitted()
    }

    fn fit(&mut self, matrix: &SparseMatrix) -> Result<()> {
        self.generator_mut().fit(matrix)
    }

    fn num_items(&self) -> Result<usize> {
        self.generator().num_items()
    }

    fn recommend(
        &self,
        user_items: &SparseMatrix,
        user_idxs: &[usize],
        n: usize,
    ) -> Result<Vec<UserRecommendations>> {
        self.generator().recommend(user_items, user_idxs, n)
    }
}

/// The trained ensemble, one model per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalEnsemble {
    models: Vec<RetrievalModel>,
}

impl RetrievalEnsemble {
    pub fn new(models: Vec<RetrievalModel>) -> Result<Self> {
        for (i, model) in models.iter().enumerate() {
            if models[..i].iter().any(|m| m.kind() == model.kind()) {
                return Err(PipelineError::InvalidInput(format!(
                    "duplicate {} model in ensemble",
                    model.kind()
                )));
            }
        }
        Ok(Self { models })
    }

    pub fn get(&self, kind: ModelKind) -> Option<&RetrievalModel> {
        self.models.iter().find(|m| m.kind() == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetrievalModel> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Train all four retrieval models
pub fn train_candidate_models(
    matrices: &InteractionMatrices,
    config: &PipelineConfig,
) -> Result<RetrievalEnsemble> {
    let mut models = Vec::with_capacity(ModelKind::ALL.len());

    for kind in ModelKind::ALL {
        let start = Instant::now();
        let mut model = RetrievalModel::from_config(kind, config);
        let matrix = model.matrix(matrices);
        model.fit(matrix)?;

        info!(
            model = %kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Trained retrieval model"
        );
        models.push(model);
    }

    RetrievalEnsemble::new(models)
}
