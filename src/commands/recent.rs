//! Recent events from durable history

use anyhow::{bail, Result};
use clap::Parser;
use colored::Colorize;
use request_lens::config;
use request_lens::observability::{EventKind, ObservedEvent};
use std::path::Path;

/// Show the most recent stored events of one kind
#[derive(Debug, Clone, Parser)]
pub struct RecentArgs {
    /// Event kind (hits, logs, exceptions)
    #[arg(short, long, default_value = "hits")]
    pub kind: String,

    /// Maximum number of events
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text")]
    pub format: String,
}

pub async fn execute(config_path: &Path, args: RecentArgs) -> Result<()> {
    let kind: EventKind = args.kind.parse()?;
    if !matches!(args.format.as_str(), "text" | "json") {
        bail!("Unknown format '{}', expected text or json", args.format);
    }

    let cfg = config::load_config(config_path)?;
    let Some(db) = super::open_history(&cfg).await? else {
        return Ok(());
    };

    let events = db.recent(kind, args.limit).await?;
    db.close().await;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("{}", format!("No {} recorded", args.kind).yellow());
        return Ok(());
    }
    for event in &events {
        println!("{}", format_event(event));
    }

    Ok(())
}

/// One-line rendering of an event
pub(crate) fn format_event(event: &ObservedEvent) -> String {
    let time = event.timestamp().format("%H:%M:%S%.3f").to_string().dimmed();
    match event {
        ObservedEvent::Hit(hit) => {
            let status = match hit.status {
                500..=599 => hit.status.to_string().red(),
                400..=499 => hit.status.to_string().yellow(),
                _ => hit.status.to_string().green(),
            };
            format!(
                "{} #{:<6} {:<7} {} {} {:.1}ms {}",
                time,
                hit.sequence,
                hit.method.bold(),
                hit.path,
                status,
                hit.duration_ms(),
                hit.correlation_id.dimmed()
            )
        }
        ObservedEvent::Log(entry) => {
            let level = entry.level.map(|l| l.as_str()).unwrap_or("-");
            let level = match level {
                "ERROR" => level.red(),
                "WARN" => level.yellow(),
                _ => level.normal(),
            };
            let text = entry
                .message()
                .map(String::from)
                .unwrap_or_else(|| serde_json::Value::Object(entry.payload.clone()).to_string());
            format!(
                "{} #{:<6} {:<5} {} {}",
                time,
                entry.sequence,
                level,
                text,
                entry.correlation_id.as_deref().unwrap_or("-").dimmed()
            )
        }
        ObservedEvent::Exception(exception) => format!(
            "{} #{:<6} {} {}: {} {}",
            time,
            exception.sequence,
            exception.method.as_deref().unwrap_or("-"),
            exception.endpoint.as_deref().unwrap_or("-"),
            exception.kind.red().bold(),
            exception.message
        ),
    }
}
