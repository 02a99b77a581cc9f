//! # Basket Recs Core
//!
//! Shared building blocks for the basket recommendation pipeline.
//!
//! ## Modules
//!
//! - `error`: Pipeline error type and result alias
//! - `config`: Layered, validated pipeline configuration
//! - `telemetry`: Structured logging initialization

pub mod config;
pub mod error;
pub mod telemetry;

// Re-export commonly used types
pub use config::{
    load_dotenv, AlsParams, Bm25Params, CosineParams, InferenceConfig, PathsConfig,
    PipelineConfig, RankerConfig, SamplingConfig, TfidfParams, DEFAULT_RANDOM_STATE,
};
pub use error::{PipelineError, Result};
pub use telemetry::{init_logging, LogFormat, LoggingConfig};
