//! Shared setup for binaries

use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install `color-eyre` and a `tracing` subscriber filtered by `RUST_LOG`
///
/// Defaults to `info` when `RUST_LOG` is unset or unparseable.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();

    if let Err(e) = color_eyre::install() {
        tracing::warn!(error = %e, "failed to install color-eyre");
    }
}
