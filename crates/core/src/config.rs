//! Pipeline configuration
//!
//! Every hyperparameter and seed used by the pipeline lives in one immutable
//! [`PipelineConfig`] that is passed explicitly into each training call.
//!
//! # Sources
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. serde defaults (the values below)
//! 2. optional file `config/basket-recs.{toml,yaml,json}`
//! 3. environment variables prefixed with `BASKET_RECS__`, nested keys separated
//!    by a double underscore
//!
//! # Example
//!
//! ```bash
//! export BASKET_RECS__INFERENCE__N_CANDIDATES="50"
//! export BASKET_RECS__ALS__FACTORS="32"
//! export BASKET_RECS__PATHS__CACHE_DIR="/data/cache"
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Seed shared by every randomised step unless overridden
pub const DEFAULT_RANDOM_STATE: u64 = 2105;

const CONFIG_FILE: &str = "config/basket-recs";
const ENV_PREFIX: &str = "BASKET_RECS";

/// BM25-weighted item-item neighbour model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// Neighbours kept per item
    pub k: usize,
    /// Term-frequency saturation
    pub k1: f32,
    /// Length normalisation strength, in `[0, 1]`
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k: 10,
            k1: 0.15,
            b: 0.66,
        }
    }
}

/// TF-IDF-weighted item-item neighbour model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TfidfParams {
    pub k: usize,
}

impl Default for TfidfParams {
    fn default() -> Self {
        Self { k: 15 }
    }
}

/// Cosine item-item neighbour model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CosineParams {
    pub k: usize,
}

impl Default for CosineParams {
    fn default() -> Self {
        Self { k: 15 }
    }
}

/// Alternating least squares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlsParams {
    /// Number of latent factors
    pub factors: usize,
    /// L2 regularisation (lambda)
    pub regularization: f32,
    pub iterations: usize,
    /// Confidence scaling for implicit feedback: `c = alpha * |r|`
    pub alpha: f32,
    pub random_state: u64,
}

impl Default for AlsParams {
    fn default() -> Self {
        Self {
            factors: 16,
            regularization: 0.01,
            iterations: 25,
            alpha: 1.0,
            random_state: DEFAULT_RANDOM_STATE,
        }
    }
}

/// Candidate inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Candidates kept per receipt and model
    pub n_candidates: usize,
    /// Receipts per block in the similarity product
    pub block_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            n_candidates: 100,
            block_size: 1000,
        }
    }
}

/// Training pair sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub seed: u64,
    /// Rejection-sampling attempts per negative before giving up
    pub max_attempts: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_RANDOM_STATE,
            max_attempts: 1000,
        }
    }
}

/// Pairwise ranker training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub seed: u64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.05,
            l2: 1e-4,
            seed: DEFAULT_RANDOM_STATE,
        }
    }
}

/// Artifact locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Intermediate tables
    pub cache_dir: PathBuf,
    /// Matrices, encoders, trained models and metrics
    pub export_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/"),
            export_dir: PathBuf::from("./export/"),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bm25: Bm25Params,
    pub tfidf: TfidfParams,
    pub cosine: CosineParams,
    pub als: AlsParams,
    pub inference: InferenceConfig,
    pub sampling: SamplingConfig,
    pub ranker: RankerConfig,
    pub paths: PathsConfig,
}

impl PipelineConfig {
    /// Load from the default config file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(CONFIG_FILE).required(false))
    }

    /// Load from an explicit config file, still honouring the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.to_str().ok_or_else(|| {
            PipelineError::config(format!("non UTF-8 path {:?}", path), "config_file")
        })?;
        Self::build(config::File::with_name(name).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PipelineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges of every section
    pub fn validate(&self) -> Result<()> {
        if self.bm25.k == 0 {
            return Err(PipelineError::config("K must be positive", "bm25.k"));
        }
        if !(0.0..=1.0).contains(&self.bm25.b) {
            return Err(PipelineError::config(
                format!("B must be within [0, 1], got {}", self.bm25.b),
                "bm25.b",
            ));
        }
        if self.bm25.k1 < 0.0 {
            return Err(PipelineError::config("K1 must be non-negative", "bm25.k1"));
        }
        if self.tfidf.k == 0 {
            return Err(PipelineError::config("K must be positive", "tfidf.k"));
        }
        if self.cosine.k == 0 {
            return Err(PipelineError::config("K must be positive", "cosine.k"));
        }
        if self.als.factors == 0 {
            return Err(PipelineError::config("factors must be positive", "als.factors"));
        }
        if self.als.regularization < 0.0 {
            return Err(PipelineError::config(
                "regularization must be non-negative",
                "als.regularization",
            ));
        }
        if self.inference.n_candidates == 0 {
            return Err(PipelineError::config(
                "n_candidates must be positive",
                "inference.n_candidates",
            ));
        }
        if self.inference.block_size == 0 {
            return Err(PipelineError::config(
                "block_size must be positive",
                "inference.block_size",
            ));
        }
        if self.sampling.max_attempts == 0 {
            return Err(PipelineError::config(
                "max_attempts must be positive",
                "sampling.max_attempts",
            ));
        }
        if self.ranker.learning_rate <= 0.0 {
            return Err(PipelineError::config(
                "learning_rate must be positive",
                "ranker.learning_rate",
            ));
        }
        Ok(())
    }
}

/// Load .env file if present
///
/// Missing files are not an error.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_matches_reference_hyperparameters() {
        let config = PipelineConfig::default();
        assert_eq!(config.bm25.k, 10);
        assert_eq!(config.bm25.k1, 0.15);
        assert_eq!(config.bm25.b, 0.66);
        assert_eq!(config.tfidf.k, 15);
        assert_eq!(config.cosine.k, 15);
        assert_eq!(config.als.factors, 16);
        assert_eq!(config.als.iterations, 25);
        assert_eq!(config.als.random_state, DEFAULT_RANDOM_STATE);
        assert_eq!(config.inference.block_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_block_size() {
        let mut config = PipelineConfig::default();
        config.inference.block_size = 0;

        let result = config.validate();
        assert!(matches!(
            result,
            Err(PipelineError::Configuration { key: Some(ref k), .. }) if k == "inference.block_size"
        ));
    }

    #[test]
    fn test_validation_rejects_out_of_range_b() {
        let mut config = PipelineConfig::default();
        config.bm25.b = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[inference]\nn_candidates = 25\n\n[als]\nfactors = 8").unwrap();

        let config = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(config.inference.n_candidates, 25);
        assert_eq!(config.inference.block_size, 1000);
        assert_eq!(config.als.factors, 8);
        assert_eq!(config.als.iterations, 25);
    }

    #[test]
    fn test_load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[tfidf]\nk = 0\n").unwrap();

        assert!(PipelineConfig::load_from(&path).is_err());
    }
}
