//! Basket recommendation pipeline
//!
//! Builds a receipt x item interaction matrix from line items, generates
//! candidates with four retrieval models (BM25, TF-IDF and cosine item-item
//! neighbours plus implicit ALS), and picks the final recommendation per
//! receipt with a pairwise ranker over context and item features.

pub mod candidates;
pub mod encoding;
pub mod features;
pub mod interactions;
pub mod matrix_factorization;
pub mod metrics;
pub mod models;
pub mod neighbours;
pub mod pipeline;
pub mod ranker;
pub mod recommendation;
pub mod sampling;
pub mod sparse;
pub mod storage;
pub mod types;

// Re-export key types
pub use candidates::{
    decode_candidates, get_candidates, inference_candidates, union_candidates, CandidateSet,
};
pub use encoding::{receipt_indices, Encoder, Encoders};
pub use features::{
    compute_item_aggregates, join_candidates_features, join_context_features, CandidateFeatureRow,
    CandidateFeatures, FeatureVector, ItemAggregates,
};
pub use interactions::{build_matrices, prepare_interactions, InteractionMatrices, InteractionTable};
pub use matrix_factorization::MatrixFactorization;
pub use metrics::{evaluate_candidates_metrics, evaluate_common_metrics};
pub use models::{train_candidate_models, CandidateGenerator, RetrievalEnsemble, RetrievalModel};
pub use neighbours::{ItemKnnRecommender, Weighting};
pub use pipeline::Pipeline;
pub use ranker::{PairwiseRanker, Ranker};
pub use recommendation::{
    candidates_with_features, rank_candidate_features, recommend, select_top, select_top_k,
};
pub use sampling::{build_training_pairs, TrainingPair};
pub use sparse::SparseMatrix;
pub use storage::{Artifact, ArtifactStore};
pub use types::*;
