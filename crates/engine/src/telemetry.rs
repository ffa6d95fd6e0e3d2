//! Subscriber installation for binaries and tests
//!
//! The engine itself only emits `tracing` events; nothing is printed until
//! the embedding application installs a subscriber. [`init_tracing`] is a
//! convenience for applications without their own setup.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, TelemetrySettings};

/// Telemetry setup errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter { filter: String, message: String },

    /// A global subscriber is already installed
    #[error("tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` wins over `settings.log_filter` when set.
pub fn init_tracing(settings: &TelemetrySettings) -> Result<(), TelemetryError> {
    let filter = build_filter(&settings.log_filter)?;

    match settings.log_format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

fn build_filter(fallback: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(fallback).map_err(|e| TelemetryError::InvalidFilter {
        filter: fallback.to_string(),
        message: e.to_string(),
    })
}
