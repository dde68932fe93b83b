pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;
pub mod signals;

use observability::{LogSink, RuntimeLogLayer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once. Commands that run the
/// pipeline use [`init_tracing_with_capture`] instead.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Initialize tracing with runtime log capture
///
/// Every `tracing` event that passes the filter is also recorded as a runtime
/// log entry through `sink`, tagged with the correlation id of the request
/// that emitted it.
pub fn init_tracing_with_capture(sink: LogSink) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(RuntimeLogLayer::new(sink));

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: Failed to install runtime log capture: {}", e);
        eprintln!("Logs will only be written to console");
    }
}
