//! Tracing setup for the `camfleet` binary
//!
//! Filtering follows `RUST_LOG`, defaulting to `info` for this crate and
//! `warn` for everything else.

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::Error;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn,camfleet=info";

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed.
pub fn init(format: LogFormat) -> Result<(), Error> {
    let registry = tracing_subscriber::registry().with(filter());
    let result = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| Error::internal_with_context("telemetry", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn second_init_fails() {
        // Another test in this binary may already have installed one
        let _ = init(LogFormat::Text);
        assert!(init(LogFormat::Json).is_err());
    }
}
