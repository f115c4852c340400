//! Tracing infrastructure.
//!
//! Structured, async-aware logging via `tracing` and `tracing-subscriber`:
//! environment-based filtering (`RUST_LOG` wins over the configured level)
//! and a choice of output formats.

use crate::config::FleetSettings;
use crate::error::{FleetError, FleetResult};
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Human-oriented format with colors (development default).
    #[default]
    Pretty,
    /// Compact single-line format without colors.
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Initialize the global subscriber from fleet settings.
///
/// Fails if a global subscriber is already installed (tests install their
/// own), so callers that don't care use `init_quietly`.
pub fn init(settings: &FleetSettings, format: OutputFormat) -> FleetResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|err| FleetError::Configuration(format!("bad log level: {err}")))?;
    let builder = fmt().with_env_filter(filter);
    let result = match format {
        OutputFormat::Pretty => builder.pretty().try_init(),
        OutputFormat::Compact => builder.compact().with_ansi(false).try_init(),
        OutputFormat::Json => builder.json().try_init(),
    };
    result.map_err(|err| FleetError::Configuration(format!("tracing init failed: {err}")))
}

/// Like [`init`], but tolerates an already-installed subscriber.
pub fn init_quietly(settings: &FleetSettings, format: OutputFormat) {
    let _ = init(settings, format);
}
