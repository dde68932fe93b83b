//! Trace query command
//!
//! Print every stored event of one request, in the order it was recorded.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use request_lens::config;
use request_lens::observability::ObservedEvent;
use std::path::Path;

/// Query and display all events of one request
#[derive(Debug, Clone, Parser)]
pub struct TraceArgs {
    /// Correlation id of the request
    pub correlation_id: String,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,
}

/// Execute the trace command
pub async fn execute(config_path: &Path, args: TraceArgs) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let Some(db) = super::open_history(&cfg).await? else {
        return Ok(());
    };

    let events = db.by_correlation(&args.correlation_id).await?;
    db.close().await;

    if events.is_empty() {
        println!(
            "{}",
            format!("No events found for correlation id: {}", args.correlation_id).yellow()
        );
        return Ok(());
    }

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    println!("{}", "=".repeat(80).dimmed());
    println!("{} {}", "Correlation ID:".bold(), args.correlation_id.cyan());
    println!("{}", "=".repeat(80).dimmed());

    for event in &events {
        println!("{}", super::recent::format_event(event));
        if let ObservedEvent::Exception(exception) = event {
            for frame in &exception.frames {
                println!("    {} {}", "at".dimmed(), frame);
            }
        }
    }

    Ok(())
}
