use anyhow::Result;
use colored::Colorize;
use request_lens::config::{self, Config};
use std::path::Path;
use tracing::info;

/// Execute the test command
///
/// This validates the configuration file without starting the server
pub fn execute(config_path: &Path) -> Result<()> {
    println!("{}", "Testing configuration...".yellow());
    info!("Loading and validating configuration");

    // Load configuration (this will validate it)
    let cfg = config::load_config(config_path)?;

    // Print success message
    println!("{}", "✓ Configuration test successful".green());
    println!();

    print_summary(&cfg);

    info!("Configuration validation completed successfully");
    Ok(())
}

fn enabled(flag: bool) -> colored::ColoredString {
    if flag {
        "enabled".green()
    } else {
        "disabled".red()
    }
}

fn print_summary(cfg: &Config) {
    let observer = &cfg.observer;

    println!("{}", "Configuration Summary:".bold());
    println!("  {}: {}:{}", "Server".cyan(), cfg.server.host, cfg.server.port);
    println!();

    println!("{}", "Capture:".cyan());
    println!("    Request hits: {}", enabled(observer.capture.enable_request_logging));
    println!("    Runtime logs: {}", enabled(observer.capture.enable_runtime_logs));
    println!("    Exceptions: {}", enabled(observer.capture.enable_exceptions));
    println!(
        "    Bodies: request {}, response {} (max {} bytes)",
        enabled(observer.capture.enable_request_body),
        enabled(observer.capture.enable_response_body),
        observer.capture.max_body_bytes
    );
    println!(
        "    Excluded paths: {}",
        observer
            .capture
            .exclude_paths
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    println!("{}", "Redaction:".cyan());
    println!("    Headers: {}", observer.redaction.mask_headers.len());
    println!("    Body fields: {}", observer.redaction.mask_body_fields.len());
    println!();

    println!("{}", "Live store:".cyan());
    println!(
        "    Capacity: {} hits, {} logs, {} exceptions",
        observer.live.hits_capacity, observer.live.logs_capacity, observer.live.exceptions_capacity
    );
    println!("    Stats window: {} requests", observer.live.stats_window);
    println!();

    println!("  {}: {}", "Durable storage".cyan(), enabled(observer.storage.enabled));
    if observer.storage.enabled {
        println!("    Database: {}", observer.storage.database_path.display());
        println!(
            "    Queue: {} events, batches of {}",
            observer.storage.queue_capacity, observer.storage.batch_size
        );
    }
}
