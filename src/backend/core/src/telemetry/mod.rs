//! Telemetry: structured logging and queue metrics.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: `panqueue_*` counters through the `metrics` facade
//!
//! The library only records metrics. Installing a recorder (Prometheus or
//! otherwise) is left to the embedding application.
//!
//! # Example
//!
//! ```rust,no_run
//! use panqueue_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, QueueMetrics};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_environment() -> String {
    std::env::var("PANQUEUE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize logging and register metric descriptions.
///
/// Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging, &config.environment)?;
    describe_metrics();
    ::tracing::debug!(environment = %config.environment, "Telemetry initialized");
    Ok(())
}
