//! Pipeline stages
//!
//! Each stage reads its inputs from the artifact store (or raw files), runs to
//! completion and writes its outputs back. Stages share nothing in memory.

use crate::candidates::{inference_candidates, CandidateSet};
use crate::encoding::Encoders;
use crate::features::{
    compute_item_aggregates, CandidateFeatureRow, CandidateFeatures, ItemAggregates, ItemPrice,
    ItemQuantity,
};
use crate::interactions::{build_matrices, prepare_interactions, InteractionMatrices, InteractionRecord};
use crate::metrics::{
    evaluate_candidates_metrics, evaluate_common_metrics, CandidateMetrics, CommonMetrics,
};
use crate::models::{train_candidate_models, RetrievalEnsemble};
use crate::ranker::PairwiseRanker;
use crate::recommendation::{candidates_with_features, rank_candidate_features};
use crate::sampling::{build_training_pairs, join_training_features};
use crate::sparse::SparseMatrix;
use crate::storage::{read_line_items, read_targets, Artifact, ArtifactStore};
use crate::types::{Candidate, LineItem, ModelKind, ReceiptId, Recommendation};
use anyhow::{Context, Result};
use basket_recs_core::telemetry::stage_span;
use basket_recs_core::PipelineConfig;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Stage runner bound to one configuration
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let store = ArtifactStore::new(&config.paths);
        Self { config, store }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Line items of the training file followed by the optional validation file
    fn read_corpus(train: &Path, val: Option<&Path>) -> Result<Vec<LineItem>> {
        let mut lines = read_line_items(train)
            .with_context(|| format!("Failed to read line items from {}", train.display()))?;
        if let Some(val) = val {
            lines.extend(
                read_line_items(val)
                    .with_context(|| format!("Failed to read line items from {}", val.display()))?,
            );
        }
        Ok(lines)
    }

    /// Build the interaction table, both matrices and the encoders
    pub fn load(&self, train: &Path, val: Option<&Path>) -> Result<InteractionMatrices> {
        let _span = stage_span("load").entered();

        let lines = Self::read_corpus(train, val)?;
        let table = prepare_interactions(&lines);
        let matrices = build_matrices(&table).context("Failed to build interaction matrices")?;

        self.store.save_table(Artifact::Rpi, &table.records)?;
        self.store.save_blob(Artifact::Spmat, &matrices.raw)?;
        self.store.save_blob(Artifact::SpmatNorm, &matrices.normalized)?;
        self.store.save_blob(Artifact::Encoders, &matrices.encoders)?;

        info!(
            line_items = lines.len(),
            interactions = table.len(),
            "Load stage finished"
        );
        Ok(matrices)
    }

    fn load_matrices(&self) -> Result<InteractionMatrices> {
        let raw: SparseMatrix = self
            .store
            .load_blob(Artifact::Spmat)
            .context("Interaction matrix missing, run `load` first")?;
        let normalized: SparseMatrix = self
            .store
            .load_blob(Artifact::SpmatNorm)
            .context("Normalized interaction matrix missing, run `load` first")?;
        let mut encoders: Encoders = self
            .store
            .load_blob(Artifact::Encoders)
            .context("Encoders missing, run `load` first")?;
        encoders.reindex();

        Ok(InteractionMatrices {
            normalized,
            raw,
            encoders,
        })
    }

    /// Interaction table as written by `load`
    pub fn load_interactions(&self) -> Result<Vec<InteractionRecord>> {
        Ok(self.store.load_table(Artifact::Rpi)?)
    }

    pub fn train_candidate_models(&self) -> Result<RetrievalEnsemble> {
        let _span = stage_span("train_candidate_models").entered();

        let matrices = self.load_matrices()?;
        let ensemble = train_candidate_models(&matrices, &self.config)
            .context("Failed to train retrieval models")?;
        self.store.save_blob(Artifact::ImplicitModels, &ensemble)?;

        info!(models = ensemble.len(), "Retrieval models trained");
        Ok(ensemble)
    }

    /// Candidates for the receipts of a basket file
    pub fn inference_candidates(&self, baskets: &Path) -> Result<CandidateSet> {
        let _span = stage_span("inference_candidates").entered();

        let matrices = self.load_matrices()?;
        let ensemble: RetrievalEnsemble = self
            .store
            .load_blob(Artifact::ImplicitModels)
            .context("Retrieval models missing, run `train-candidate-models` first")?;

        let lines = read_line_items(baskets)
            .with_context(|| format!("Failed to read baskets from {}", baskets.display()))?;
        let mut receipt_ids: Vec<ReceiptId> = lines.iter().map(|l| l.receipt_id).collect();
        receipt_ids.sort_unstable();
        receipt_ids.dedup();

        let set = inference_candidates(&ensemble, &matrices, &receipt_ids, &self.config.inference)
            .context("Candidate inference failed")?;

        for (kind, table) in &set.per_model {
            self.store
                .save_table(Artifact::ModelCandidates(*kind), table)?;
        }
        self.store.save_table(Artifact::Candidates, &set.union)?;

        info!(
            receipts = receipt_ids.len(),
            candidates = set.union.len(),
            "Candidate inference finished"
        );
        Ok(set)
    }

    fn load_candidates(&self) -> Result<CandidateSet> {
        let union: Vec<Candidate> = self
            .store
            .load_table(Artifact::Candidates)
            .context("Candidates missing, run `inference-candidates` first")?;

        let mut per_model = BTreeMap::new();
        for kind in ModelKind::ALL {
            let artifact = Artifact::ModelCandidates(kind);
            if self.store.exists(artifact) {
                per_model.insert(kind, self.store.load_table(artifact)?);
            }
        }

        Ok(CandidateSet { per_model, union })
    }

    fn load_aggregates(&self) -> Result<ItemAggregates> {
        let prices: Vec<ItemPrice> = self
            .store
            .load_table(Artifact::Prices)
            .context("Price table missing, run `train-ranker` first")?;
        let quantities: Vec<ItemQuantity> = self
            .store
            .load_table(Artifact::Quantities)
            .context("Quantity table missing, run `train-ranker` first")?;
        Ok(ItemAggregates::from_rows(&prices, &quantities))
    }

    /// Aggregates, training pairs and the pairwise ranker
    pub fn train_ranker(&self, train: &Path, val: Option<&Path>) -> Result<PairwiseRanker> {
        let _span = stage_span("train_ranker").entered();

        let train_lines = read_line_items(train)
            .with_context(|| format!("Failed to read line items from {}", train.display()))?;
        let val_lines = match val {
            Some(val) => read_line_items(val)
                .with_context(|| format!("Failed to read line items from {}", val.display()))?,
            None => Vec::new(),
        };

        let corpus: Vec<LineItem> = train_lines.iter().chain(&val_lines).cloned().collect();
        let aggregates = compute_item_aggregates(&corpus);

        let pairs = build_training_pairs(&train_lines, &val_lines, &aggregates, &self.config.sampling)
            .context("Failed to sample training pairs")?;
        let labeled = join_training_features(&pairs, &aggregates);
        let ranker =
            PairwiseRanker::fit(&labeled, &self.config.ranker).context("Failed to train ranker")?;

        self.store.save_blob(Artifact::Ranker, &ranker)?;
        self.store.save_table(Artifact::Prices, &aggregates.price_rows())?;
        self.store
            .save_table(Artifact::Quantities, &aggregates.quantity_rows())?;

        info!(pairs = pairs.len(), "Ranker trained");
        Ok(ranker)
    }

    /// Join the stored candidates with the features of the receipts in `context`
    pub fn candidates_join_features(&self, context: &Path) -> Result<Vec<CandidateFeatures>> {
        let _span = stage_span("candidates_join_features").entered();

        let candidates = self.load_candidates()?;
        let aggregates = self.load_aggregates()?;
        let lines = read_line_items(context)
            .with_context(|| format!("Failed to read context from {}", context.display()))?;

        let rows = candidates_with_features(&candidates.union, &lines, &aggregates);
        let table: Vec<CandidateFeatureRow> = rows.iter().map(CandidateFeatureRow::from).collect();
        self.store
            .save_table(Artifact::CandidatesWithFeatures, &table)?;

        info!(rows = rows.len(), "Candidate features joined");
        Ok(rows)
    }

    /// Candidate feature table as written by `candidates_join_features`
    pub fn load_candidates_with_features(&self) -> Result<Vec<CandidateFeatures>> {
        let table: Vec<CandidateFeatureRow> = self
            .store
            .load_table(Artifact::CandidatesWithFeatures)
            .context("Candidate features missing, run `candidates-join-features` first")?;
        Ok(table.into_iter().map(CandidateFeatures::from).collect())
    }

    /// Top `k` candidates per receipt, scored against the receipts in `context`
    pub fn make_recommendations(&self, context: &Path, k: usize) -> Result<Vec<Recommendation>> {
        let _span = stage_span("make_recommendations").entered();

        let ranker: PairwiseRanker = self
            .store
            .load_blob(Artifact::Ranker)
            .context("Ranker missing, run `train-ranker` first")?;
        let rows = self.candidates_join_features(context)?;

        let recommendations = rank_candidate_features(&rows, &ranker, k);
        self.store
            .save_table(Artifact::Recommendations, &recommendations)?;

        Ok(recommendations)
    }

    pub fn evaluate_common_metrics(&self, targets: &Path) -> Result<CommonMetrics> {
        let _span = stage_span("evaluate_common_metrics").entered();

        let targets = read_targets(targets)
            .with_context(|| format!("Failed to read targets from {}", targets.display()))?;
        let recommendations: Vec<Recommendation> = self
            .store
            .load_table(Artifact::Recommendations)
            .context("Recommendations missing, run `make-recommendations` first")?;

        let metrics = evaluate_common_metrics(&targets, &recommendations)?;
        self.store.save_json(Artifact::CommonMetrics, &metrics)?;
        Ok(metrics)
    }

    pub fn evaluate_candidates_metrics(&self, targets: &Path) -> Result<CandidateMetrics> {
        let _span = stage_span("evaluate_candidates_metrics").entered();

        let targets = read_targets(targets)
            .with_context(|| format!("Failed to read targets from {}", targets.display()))?;
        let candidates = self.load_candidates()?;

        let metrics = evaluate_candidates_metrics(&targets, &candidates)?;
        self.store.save_json(Artifact::CandidatesMetrics, &metrics)?;
        Ok(metrics)
    }

    /// Stored recommendations of one receipt
    pub fn show(&self, receipt_id: ReceiptId) -> Result<Vec<Recommendation>> {
        let recommendations: Vec<Recommendation> = self
            .store
            .load_table(Artifact::Recommendations)
            .context("Recommendations missing, run `make-recommendations` first")?;
        Ok(recommendations
            .into_iter()
            .filter(|r| r.receipt_id == receipt_id)
            .collect())
    }
}
