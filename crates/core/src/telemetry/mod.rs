//! Logging for the pipeline binaries
//!
//! Library code emits `tracing` events only; the binary installs the
//! subscriber once through [`init_logging`].
//!
//! # Example
//!
//! ```rust,no_run
//! use basket_recs_core::telemetry::{init_logging, LoggingConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging(LoggingConfig::from_env()?)?;
//!     Ok(())
//! }
//! ```

pub mod tracing;

pub use self::tracing::{init_logging, stage_span, LogFormat, LoggingConfig, TelemetryError};
