//! Command implementations for the CLI
//!
//! This module contains the implementation of all CLI commands:
//! - start: Run the demo application with the pipeline attached
//! - test: Test configuration validity
//! - config: Configuration display and validation
//! - sessions: List and delete recorded sessions
//! - recent: Recent events from durable history
//! - trace: All events of one request

pub mod config;
pub mod recent;
pub mod sessions;
pub mod start;
pub mod test;
pub mod trace;

use anyhow::{Context, Result};
use colored::Colorize;
use request_lens::config::Config;
use request_lens::observability::EventDb;

/// Open the durable store named by the configuration
///
/// Returns `None` (after telling the user) when storage is disabled or the
/// database file does not exist yet.
pub(crate) async fn open_history(cfg: &Config) -> Result<Option<EventDb>> {
    let storage = &cfg.observer.storage;
    if !storage.enabled {
        eprintln!("{}", "Durable storage is disabled in the configuration".red());
        return Ok(None);
    }
    if !storage.database_path.exists() {
        eprintln!(
            "{}",
            format!("No database at {}", storage.database_path.display()).yellow()
        );
        return Ok(None);
    }

    let db = EventDb::open_path(&storage.database_path)
        .await
        .with_context(|| format!("Failed to open {}", storage.database_path.display()))?;
    Ok(Some(db))
}
