use std::env;

use thiserror::Error;
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::SubscriberExt;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `CERTFLOW_LOG`, then `RUST_LOG`, then `info`.
/// Events are written by the `fmt` layer with their targets.
///
/// # Errors
///
/// Returns `TelemetryError` for an unparsable filter or when a global
/// subscriber is already installed.
pub fn init_tracing() -> Result<(), TelemetryError> {
    let filter = filter_directive(|name| env::var(name).ok());
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter)?)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(SystemTime)
                .with_target(true),
        );
    set_global_default(subscriber)?;
    Ok(())
}

fn filter_directive(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("CERTFLOW_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
