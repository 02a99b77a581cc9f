//! Error types shared by every pipeline stage
//!
//! All preconditions of the batch pipeline surface through [`PipelineError`].
//! Nothing in the core retries; the orchestrating caller decides whether a
//! failure aborts the run.

use thiserror::Error;

/// Result alias used across the pipeline crates
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An encoded index has no raw identifier behind it
    #[error("Index {index} is not present in the {encoder} encoder")]
    UnknownIndex { encoder: String, index: usize },

    /// `recommend` (or `score`) was called on an untrained model
    #[error("Model {0} is not fitted")]
    ModelNotFitted(String),

    /// `fit` was called on a model that is already trained
    #[error("Model {0} is already fitted")]
    ModelAlreadyFitted(String),

    /// Rejection sampling ran out of attempts
    #[error("Cannot sample negative for receipt {receipt_id} after {attempts} attempts")]
    NegativeSamplingExhausted { receipt_id: i64, attempts: usize },

    /// Matrix operands have incompatible shapes
    #[error("Shape mismatch in {operation}: {left:?} vs {right:?}")]
    ShapeMismatch {
        operation: String,
        left: (usize, usize),
        right: (usize, usize),
    },

    /// Row index outside of the matrix
    #[error("Row {row} out of bounds for matrix with {rows} rows")]
    RowOutOfBounds { row: usize, rows: usize },

    /// A stage received nothing to work with
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Linear system in a least-squares step could not be solved
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
    },

    /// Malformed input row
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Shorthand for a configuration error bound to a key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// True for errors caused by calling a model out of order
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::ModelNotFitted(_) | PipelineError::ModelAlreadyFitted(_)
        )
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Configuration {
            message: err.to_string(),
            key: None,
        }
    }
}
