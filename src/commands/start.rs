use anyhow::{Context, Result};
use colored::Colorize;
use request_lens::observability::Observer;
use request_lens::{config, init_tracing_with_capture, server};
use std::path::Path;
use tracing::info;

/// Execute the start command
///
/// This will:
/// 1. Load configuration
/// 2. Start the observation pipeline (opening durable storage if enabled)
/// 3. Install tracing with runtime log capture
/// 4. Start the server
pub async fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Starting request-lens demo...".green());

    // Load configuration
    let cfg = config::load_config(config_path)?;

    let observer = Observer::start(&cfg.observer)
        .await
        .context("Failed to start the observation pipeline")?;

    init_tracing_with_capture(observer.log_sink());
    info!("Observation pipeline started");

    // Start the server (blocks until shutdown)
    server::start_server(cfg, observer).await?;

    Ok(())
}
