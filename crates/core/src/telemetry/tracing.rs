//! Structured logging configuration and initialization

use thiserror::Error;
use tracing::{span, Level, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log format: {0} (expected 'pretty' or 'json')")]
    InvalidFormat(String),

    #[error("Failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(TelemetryError::InvalidFormat(other.to_string())),
        }
    }
}

/// Configuration for pipeline logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Application name recorded on startup
    pub service_name: String,

    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_name: "basket-recs".to_string(),
            default_filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    /// Create config from environment variables
    ///
    /// - SERVICE_NAME: Application identifier
    /// - LOG_FORMAT: `pretty` (default) or `json`
    pub fn from_env() -> Result<Self, TelemetryError> {
        let service_name =
            std::env::var("SERVICE_NAME").unwrap_or_else(|_| "basket-recs".to_string());

        let format = match std::env::var("LOG_FORMAT") {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::Pretty,
        };

        Ok(Self {
            service_name,
            format,
            ..Self::default()
        })
    }
}

/// Initialize the global tracing subscriber
///
/// Must be called once, by the binary. Library code only emits events.
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.as_str()));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Pretty => subscriber
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?,
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?,
    }

    tracing::info!(
        service_name = %config.service_name,
        format = ?config.format,
        "Logging initialized"
    );

    Ok(())
}

/// Create a span covering one pipeline stage
///
/// ```rust
/// use basket_recs_core::telemetry::stage_span;
///
/// let span = stage_span("inference_candidates");
/// let _guard = span.enter();
/// ```
pub fn stage_span(stage: &str) -> Span {
    span!(Level::INFO, "pipeline.stage", stage = %stage)
}
